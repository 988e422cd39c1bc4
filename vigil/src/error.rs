//! Error types for the monitoring engine

use crate::clock::Timestamp;
use thiserror::Error;

/// Status returned to the external command layer on success.
pub const OK: i32 = 0;

/// Status returned to the external command layer on failure.
pub const ERROR: i32 = -2;

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    /// Host downtime requested without a host name
    #[error("can not create a host downtime on host with empty name")]
    EmptyHostName,

    /// Service downtime requested without host name or description
    #[error("can not create a service downtime on host with empty name or service with empty description")]
    EmptyServiceTarget,

    /// Downtime references a parent that does not exist
    #[error("downtime is triggered by unknown downtime {0}")]
    DanglingTrigger(u64),

    /// Downtime window where start is not before end
    #[error("invalid downtime window: start {start} is not before end {end}")]
    InvalidWindow { start: Timestamp, end: Timestamp },

    /// Downtime window that already ended
    #[error("downtime window already ended at {0}")]
    ExpiredWindow(Timestamp),

    /// Downtime not found
    #[error("downtime not found: {0}")]
    DowntimeNotFound(u64),

    /// Host not found
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Service not found
    #[error("service not found: {host}/{service}")]
    ServiceNotFound { host: String, service: String },

    /// Comment not found
    #[error("comment not found: {0}")]
    CommentNotFound(u64),

    /// Malformed or unsupported external command
    #[error("invalid external command: {0}")]
    InvalidCommand(String),

    /// External command refused by current settings
    #[error("external command rejected: {0}")]
    CommandRejected(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Timed event whose payload does not fit its type
    #[error("malformed timed event: {0}")]
    MalformedEvent(String),

    /// Both event queues are empty
    #[error("there aren't any events that need to be handled")]
    NoScheduledEvents,

    /// Check could not be started
    #[error("check execution failed: {0}")]
    Check(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Check if this error indicates a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DowntimeNotFound(_)
                | Self::HostNotFound(_)
                | Self::ServiceNotFound { .. }
                | Self::CommentNotFound(_)
        )
    }

    /// Check if this error is a validation failure of the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyHostName
                | Self::EmptyServiceTarget
                | Self::DanglingTrigger(_)
                | Self::InvalidWindow { .. }
                | Self::ExpiredWindow(_)
                | Self::InvalidCommand(_)
        )
    }

    /// Convert to the integer status used by the external command layer
    pub fn status_code(&self) -> i32 {
        ERROR
    }
}

/// Map an operation outcome to an external command status.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => OK,
        Err(e) => e.status_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(EngineError::DowntimeNotFound(3).is_not_found());
        assert!(!EngineError::DowntimeNotFound(3).is_validation());
        assert!(EngineError::DanglingTrigger(9).is_validation());
        assert!(EngineError::InvalidWindow { start: 10, end: 5 }.is_validation());
        assert!(!EngineError::NoScheduledEvents.is_not_found());
    }

    #[test]
    fn test_status_codes() {
        let ok: Result<()> = Ok(());
        let err: Result<()> = Err(EngineError::EmptyHostName);
        assert_eq!(status_of(&ok), OK);
        assert_eq!(status_of(&err), ERROR);
    }
}
