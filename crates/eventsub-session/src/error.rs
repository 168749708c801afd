//! Error types for the session client.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by [`SessionClient`](crate::SessionClient) operations.
///
/// Protocol-level problems (bad frames, lost connections, failing handlers)
/// never show up here: they are handled inside the driver and reported through
/// handlers, events and metrics.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("keepalive_grace_factor", "must be at least 1.0");
        assert_eq!(
            err.to_string(),
            "Invalid value for keepalive_grace_factor: must be at least 1.0"
        );

        let err: SessionError = err.into();
        assert!(err.to_string().starts_with("Invalid configuration:"));
    }
}
