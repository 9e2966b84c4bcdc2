//! Where the UI API lives: endpoint parsing, normalization and resolution.
//!
//! The profile monitor serves its UI API as a WebSocket at `/api-v1` on port
//! 9030. Users rarely type all of that, so [`normalize_url`] accepts a bare
//! host, a `host:port` pair or an http(s) URL and fills in the rest.
//!
//! [`resolve_endpoint`] picks the address a session dials:
//!
//! | Source | Invalid value |
//! |---|---|
//! | `--endpoint` on the command line | error |
//! | `endpoint.url` in the config file | skipped with a warning |
//! | `PROFMON_ENDPOINT` | skipped with a warning |
//! | `ws://127.0.0.1:9030/api-v1` | n/a |
//!
//! ```
//! use profmon_client::connection::{AddressSource, EndpointAddress};
//!
//! let addr = EndpointAddress::parse("10.0.0.5", AddressSource::UserInput)?;
//! assert_eq!(addr.as_str(), "ws://10.0.0.5:9030/api-v1");
//! assert_eq!(addr.original(), "10.0.0.5");
//! # Ok::<(), profmon_client::connection::AddressError>(())
//! ```

use std::fmt;
use thiserror::Error;
use url::Url;

use crate::error::Result;

/// Environment variable consulted by [`resolve_endpoint`].
pub const ENDPOINT_ENV_VAR: &str = "PROFMON_ENDPOINT";

/// Default TCP port of the UI API server.
pub const DEFAULT_API_PORT: u16 = 9030;

/// Path the UI API is served under.
pub const DEFAULT_API_PATH: &str = "/api-v1";

/// Dialed when nothing else is configured.
pub const DEFAULT_ENDPOINT_URL: &str = "ws://127.0.0.1:9030/api-v1";

/// Which setting an [`EndpointAddress`] was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// Built-in [`DEFAULT_ENDPOINT_URL`]
    Default,
    /// [`ENDPOINT_ENV_VAR`]
    Environment,
    /// Configuration file
    Persisted,
    /// Command line
    UserInput,
}

impl AddressSource {
    /// Short name used in log fields and status output.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Environment => "env",
            Self::Persisted => "config",
            Self::UserInput => "cli",
        }
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("built-in default"),
            Self::Environment => write!(f, "{ENDPOINT_ENV_VAR} environment variable"),
            Self::Persisted => f.write_str("configuration file"),
            Self::UserInput => f.write_str("command line"),
        }
    }
}

/// A normalized WebSocket URL plus what the user actually wrote.
///
/// Every reconnect of a session dials this same address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    url: String,
    source: AddressSource,
    original: String,
}

impl EndpointAddress {
    /// Normalize `input` with [`normalize_url`] and remember where it came from.
    pub fn parse(input: &str, source: AddressSource) -> std::result::Result<Self, AddressError> {
        Ok(Self {
            url: normalize_url(input)?.into(),
            source,
            original: input.trim().to_owned(),
        })
    }

    /// The normalized URL.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Which setting this address was taken from.
    #[must_use]
    pub fn source(&self) -> AddressSource {
        self.source
    }

    /// The input as given, before normalization.
    #[must_use]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// True for `wss://`.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.url.starts_with("wss:")
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for EndpointAddress {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT_URL.to_owned(),
            source: AddressSource::Default,
            original: DEFAULT_ENDPOINT_URL.to_owned(),
        }
    }
}

/// Why an endpoint string was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Blank input
    #[error("endpoint is empty")]
    EmptyInput,

    /// `url` could not parse it
    #[error("not a URL: {0}")]
    InvalidUrl(String),

    /// Parsed, but without a host
    #[error("URL has no host")]
    MissingHost,

    /// The default port could not be applied
    #[error("cannot use port: {0}")]
    InvalidPort(String),

    /// Not ws, wss, http or https
    #[error("scheme '{0}' is not supported (use ws, wss, http or https)")]
    UnsupportedScheme(String),
}

/// Map a user-facing scheme onto its WebSocket counterpart.
fn websocket_scheme(scheme: &str) -> Option<&'static str> {
    match scheme {
        "ws" | "http" => Some("ws"),
        "wss" | "https" => Some("wss"),
        _ => None,
    }
}

/// Turn loose user input into a full UI API URL.
///
/// A missing scheme means `ws`; `http`/`https` become `ws`/`wss`. A missing
/// port becomes 9030 and an empty path becomes `/api-v1`. Explicit ports and
/// paths are kept.
///
/// ```
/// use profmon_client::connection::normalize_url;
///
/// assert_eq!(normalize_url("lab-pc")?.as_str(), "ws://lab-pc:9030/api-v1");
/// assert_eq!(
///     normalize_url("https://profmon.example.org")?.as_str(),
///     "wss://profmon.example.org:9030/api-v1"
/// );
/// assert_eq!(normalize_url("ws://[::1]:8080/custom")?.as_str(), "ws://[::1]:8080/custom");
/// # Ok::<(), profmon_client::connection::AddressError>(())
/// ```
pub fn normalize_url(input: &str) -> std::result::Result<Url, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::EmptyInput);
    }

    let candidate = match trimmed.split_once("://") {
        Some(_) => trimmed.to_owned(),
        None => format!("ws://{trimmed}"),
    };
    let mut url = Url::parse(&candidate).map_err(|e| AddressError::InvalidUrl(e.to_string()))?;

    let given = url.scheme().to_ascii_lowercase();
    let scheme = websocket_scheme(&given)
        .ok_or_else(|| AddressError::UnsupportedScheme(given.clone()))?;
    url.set_scheme(scheme)
        .map_err(|()| AddressError::UnsupportedScheme(given))?;

    if url.host_str().map_or(true, str::is_empty) {
        return Err(AddressError::MissingHost);
    }
    if url.port().is_none() {
        url.set_port(Some(DEFAULT_API_PORT))
            .map_err(|()| AddressError::InvalidPort(DEFAULT_API_PORT.to_string()))?;
    }
    if matches!(url.path(), "" | "/") {
        url.set_path(DEFAULT_API_PATH);
    }
    Ok(url)
}

/// Pick the endpoint a session dials.
///
/// A non-blank `user_input` is authoritative: if it does not parse, that is
/// an error. The config file value and [`ENDPOINT_ENV_VAR`] are fallbacks;
/// an unusable fallback is logged and skipped.
pub fn resolve_endpoint(
    user_input: Option<&str>,
    persisted: Option<&str>,
) -> Result<EndpointAddress> {
    if let Some(input) = user_input.filter(|s| !s.trim().is_empty()) {
        return Ok(EndpointAddress::parse(input, AddressSource::UserInput)?);
    }

    let from_env = std::env::var(ENDPOINT_ENV_VAR).ok();
    let fallbacks = [
        (persisted, AddressSource::Persisted),
        (from_env.as_deref(), AddressSource::Environment),
    ];
    for (value, source) in fallbacks {
        let Some(value) = value else { continue };
        match EndpointAddress::parse(value, source) {
            Ok(addr) => return Ok(addr),
            Err(e) => {
                tracing::warn!(source = source.label(), "Skipping endpoint '{}': {}", value, e);
            }
        }
    }

    Ok(EndpointAddress::default())
}
