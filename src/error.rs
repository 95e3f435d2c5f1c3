// outpost: Error types

use thiserror::Error;

/// Outpost result type
pub type OutpostResult<T> = Result<T, OutpostError>;

/// Outpost error types
///
/// Pipeline errors (PIN mismatch, bad prefix, timeout) ride inside a
/// CommandResult and are rendered by the originating front; daemon errors
/// bubble up to the supervisor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutpostError {
    #[error("PIN/shortcut not found")]
    PinAndShortcutNotFound,

    #[error("Bad prefix")]
    BadPrefix,

    #[error("Timeout")]
    FeatureTimeout,

    #[error("Feature is not fully configured")]
    IncompleteConfig,

    #[error("Emergency lock-down is in effect")]
    EmergencyLockDown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Mail error: {0}")]
    MailError(String),

    #[error("Feature error: {0}")]
    FeatureError(String),
}

impl From<std::io::Error> for OutpostError {
    fn from(err: std::io::Error) -> Self {
        OutpostError::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for OutpostError {
    fn from(err: serde_json::Error) -> Self {
        OutpostError::ConfigError(err.to_string())
    }
}
