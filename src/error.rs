//! Application error type.
//!
//! `AppError` covers what can go wrong before a session exists: loading and
//! validating configuration, installing the log subscriber, and resolving
//! the endpoint. Failures of individual calls are reported as
//! [`profmon_client::CallError`] and only reach this type at the CLI boundary.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Errors raised by the profmon application layer.
#[derive(Error, Debug)]
pub enum AppError {
    /// The configuration sources could not be read or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The log subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// The client rejected the endpoint or the session settings.
    #[error(transparent)]
    Client(#[from] profmon_client::ClientError),
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = AppError::Configuration("log_level 'loud' is not valid".into());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: log_level 'loud' is not valid"
        );
    }

    #[test]
    fn test_client_error_is_transparent() {
        let config = crate::config::AppConfig::default();
        let err = config.endpoint(Some("gopher://lab-pc")).unwrap_err();
        assert!(matches!(err, AppError::Client(_)));
        assert!(err.to_string().starts_with("Invalid endpoint: scheme 'gopher'"));
    }
}
