//! Configuration loading using Figment.
//!
//! Configuration is merged from:
//! 1. `config/profmon.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `PROFMON_`, nested keys split on `__`
//!
//! `PROFMON_ENDPOINT` is not a config key; the client reads it directly as
//! the endpoint fallback, after the config file.
//!
//! # Example
//! ```no_run
//! use profmon::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Endpoint: {}", config.endpoint(None)?);
//! # Ok::<(), profmon::error::AppError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use profmon_client::{resolve_endpoint, EndpointAddress, ReconnectConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/profmon.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where the profile monitor listens
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    /// Handshake credentials
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Endpoint configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL; normalized before use
    #[serde(default)]
    pub url: Option<String>,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Delay of the first non-immediate retry, in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    /// Ceiling on the delay between attempts, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Add up to 25% random jitter to each delay
    #[serde(default)]
    pub jitter: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            jitter: false,
        }
    }
}

/// Auth handshake configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token presented in `authenticate_connection`
    #[serde(default)]
    pub token: Option<String>,
}

// Default value functions
fn default_name() -> String {
    "profmon".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    60
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl AppConfig {
    /// Load configuration from `config/profmon.toml` and environment variables.
    ///
    /// Environment variables override the file with prefix `PROFMON_`.
    /// Example: `PROFMON_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not
    /// an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(AppError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PROFMON_").ignore(&["endpoint"]).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(AppError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !VALID_LOG_FORMATS.contains(&format.as_str()) {
            return Err(AppError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_LOG_FORMATS.join(", ")
            )));
        }

        if self.reconnect.initial_delay_secs == 0 {
            return Err(AppError::Configuration(
                "reconnect.initial_delay_secs must be at least 1".to_string(),
            ));
        }
        if self.reconnect.max_delay_secs < self.reconnect.initial_delay_secs {
            return Err(AppError::Configuration(format!(
                "reconnect.max_delay_secs ({}) is below initial_delay_secs ({})",
                self.reconnect.max_delay_secs, self.reconnect.initial_delay_secs
            )));
        }

        if let Some(url) = &self.endpoint.url {
            EndpointAddress::parse(url, profmon_client::AddressSource::Persisted)
                .map_err(|e| AppError::Configuration(format!("endpoint.url: {e}")))?;
        }

        Ok(())
    }

    /// Resolve the endpoint: command line, then config file, then
    /// `PROFMON_ENDPOINT`, then the built-in default.
    ///
    /// An unparsable command-line endpoint is an [`AppError::Client`].
    pub fn endpoint(&self, cli: Option<&str>) -> AppResult<EndpointAddress> {
        Ok(resolve_endpoint(cli, self.endpoint.url.as_deref())?)
    }

    /// Session settings for the client crate.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_secs(self.reconnect.initial_delay_secs),
                max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
                jitter: self.reconnect.jitter,
                ..ReconnectConfig::default()
            },
            auth_token: self.auth.token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profmon_client::{AddressError, AddressSource, ClientError};
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.session_config().reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.session_config().auth_token, None);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"
            log_format = "json"

            [endpoint]
            url = "lab-pc:9031"

            [reconnect]
            max_delay_secs = 30
            jitter = true

            [auth]
            token = "s3cret"
            "#,
        );

        let config = AppConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.name, "profmon");
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.endpoint(None).unwrap().as_str(), "ws://lab-pc:9031/api-v1");

        let session = config.session_config();
        assert_eq!(session.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(session.reconnect.max_delay, Duration::from_secs(30));
        assert!(session.reconnect.jitter);
        assert_eq!(session.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[application]\nlog_level = \"warn\"\n");
        std::env::set_var("PROFMON_APPLICATION__LOG_LEVEL", "trace");
        std::env::set_var("PROFMON_RECONNECT__MAX_DELAY_SECS", "5");
        std::env::set_var("PROFMON_ENDPOINT", "ws://ignored-by-figment:1/api-v1");

        let result = AppConfig::load_from(file.path());

        std::env::remove_var("PROFMON_APPLICATION__LOG_LEVEL");
        std::env::remove_var("PROFMON_RECONNECT__MAX_DELAY_SECS");
        std::env::remove_var("PROFMON_ENDPOINT");

        let config = result.unwrap();
        assert_eq!(config.application.log_level, "trace");
        assert_eq!(config.reconnect.max_delay_secs, 5);
        assert_eq!(config.endpoint.url, None);
    }

    #[test]
    fn test_cli_endpoint_wins() {
        let config = AppConfig {
            endpoint: EndpointConfig {
                url: Some("ws://from-file:9030/api-v1".into()),
            },
            ..Default::default()
        };
        assert_eq!(
            config.endpoint(Some("from-cli")).unwrap().as_str(),
            "ws://from-cli:9030/api-v1"
        );
        assert_eq!(
            config.endpoint(None).unwrap().as_str(),
            "ws://from-file:9030/api-v1"
        );
    }

    #[test]
    fn test_bad_cli_endpoint_is_client_error() {
        let config = AppConfig::default();
        match config.endpoint(Some("ftp://lab-pc")) {
            Err(AppError::Client(ClientError::Address(AddressError::UnsupportedScheme(s)))) => {
                assert_eq!(s, "ftp");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_shipped_config_defers_to_env_endpoint() {
        let shipped = concat!(env!("CARGO_MANIFEST_DIR"), "/config/profmon.toml");
        let config = AppConfig::load_from(shipped).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.url, None);

        std::env::set_var("PROFMON_ENDPOINT", "lab-pc:9031");
        let endpoint = config.endpoint(None);
        std::env::remove_var("PROFMON_ENDPOINT");

        let endpoint = endpoint.unwrap();
        assert_eq!(endpoint.as_str(), "ws://lab-pc:9031/api-v1");
        assert_eq!(endpoint.source(), AddressSource::Environment);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".into();
        assert!(matches!(config.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = AppConfig::default();
        config.application.log_format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff_bounds() {
        let mut config = AppConfig::default();
        config.reconnect.initial_delay_secs = 10;
        config.reconnect.max_delay_secs = 5;
        assert!(config.validate().is_err());

        config.reconnect.initial_delay_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_endpoint_url() {
        let mut config = AppConfig::default();
        config.endpoint.url = Some("ws://".into());
        assert!(config.validate().is_err());
    }
}
