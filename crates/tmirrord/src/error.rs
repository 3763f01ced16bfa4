//! Error types for tmirrord

use thiserror::Error;
use tmirror_engine::{BackfillError, BootstrapError, ConfigError, EventError};

/// Invocation host errors
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Daemon configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Policy document or engine settings rejected
    #[error(transparent)]
    Policy(#[from] ConfigError),

    /// No region could be determined for policy selection
    #[error("No region given: pass --region, or set TMIRROR_REGION or AWS_REGION")]
    MissingRegion,

    /// Invocation payload is not valid JSON of the expected shape
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Event could not be turned into an interface
    #[error(transparent)]
    Event(#[from] EventError),

    /// Backfill page failed and should be redelivered
    #[error(transparent)]
    Backfill(#[from] BackfillError),

    /// Bootstrap hook failed
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tmirrord operations
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaemonError::Configuration("bad log format".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad log format");
    }

    #[test]
    fn test_policy_error_is_transparent() {
        let err: DaemonError = ConfigError::Empty.into();
        assert_eq!(err.to_string(), ConfigError::Empty.to_string());
    }
}
