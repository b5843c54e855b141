//! Error types module
//!
//! All failures in the upload/chain path are classified into one of the
//! variants below. Classification decides three things: whether the chain
//! runner retries locally (`is_retryable`), whether a message consumer may
//! leave the delivery unacknowledged for broker redelivery, and the log
//! level the failure is reported at.

use std::time::Duration;

use uuid::Uuid;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like transient I/O
    Warn,
    /// Error level - for unexpected failures
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    /// Bad parameters, missing required plugin parameter, malformed ids.
    /// Never retried; no stack captured since expected.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Task, file, or plugin absent. Terminal for the current operation.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network/socket-class failure during plugin execution or storage
    /// access. Retried locally up to the configured maximum.
    #[error("I/O failure: {0}")]
    TransientIo(String),

    /// A plugin invocation exceeded its allotted time. Retried like
    /// transient I/O; exhausting retries becomes a terminal chain error.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Operation attempted against a task in the wrong state. Never
    /// retried automatically; the caller must reload.
    #[error("Invalid state: {operation} not allowed while task {task_id} is {status}")]
    StateConflict {
        task_id: Uuid,
        operation: &'static str,
        status: String,
    },

    /// A file reference exists with no reachable storage copy. Always
    /// surfaced, never silently recovered.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Anything unclassified. Treated conservatively as retryable at the
    /// transport level.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DepotError {
    /// Whether the chain runner may retry the failed attempt locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DepotError::TransientIo(_) | DepotError::Timeout(_))
    }

    /// Whether a message carrying this failure should stay unacknowledged
    /// so the broker redelivers it. Expected terminal outcomes are always
    /// acknowledged; only unclassified errors are left for redelivery.
    pub fn is_redeliverable(&self) -> bool {
        matches!(self, DepotError::Internal(_))
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            DepotError::Validation(_) | DepotError::NotFound(_) => LogLevel::Debug,
            DepotError::TransientIo(_)
            | DepotError::Timeout(_)
            | DepotError::StateConflict { .. } => LogLevel::Warn,
            DepotError::Corruption(_) | DepotError::Internal(_) => LogLevel::Error,
        }
    }

    /// Error kind name used in structured log fields and dead letters.
    pub fn kind(&self) -> &'static str {
        match self {
            DepotError::Validation(_) => "validation",
            DepotError::NotFound(_) => "not_found",
            DepotError::TransientIo(_) => "transient_io",
            DepotError::Timeout(_) => "timeout",
            DepotError::StateConflict { .. } => "state_conflict",
            DepotError::Corruption(_) => "corruption",
            DepotError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for DepotError {
    fn from(err: std::io::Error) -> Self {
        DepotError::TransientIo(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for DepotError {
    fn from(err: serde_json::Error) -> Self {
        DepotError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for DepotError {
    fn from(err: uuid::Error) -> Self {
        DepotError::Validation(format!("UUID parsing error: {}", err))
    }
}

/// Result type for operations that fail with a classified error.
pub type DepotResult<T> = Result<T, DepotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DepotError::TransientIo("socket reset".into()).is_retryable());
        assert!(DepotError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!DepotError::Validation("bad arg".into()).is_retryable());
        assert!(!DepotError::NotFound("task".into()).is_retryable());
        assert!(!DepotError::Corruption("no copies".into()).is_retryable());
    }

    #[test]
    fn test_redeliverable_only_for_unclassified() {
        assert!(DepotError::Internal(anyhow::anyhow!("boom")).is_redeliverable());
        assert!(!DepotError::Timeout(Duration::from_secs(1)).is_redeliverable());
        assert!(!DepotError::Validation("x".into()).is_redeliverable());
    }

    #[test]
    fn test_state_conflict_message() {
        let err = DepotError::StateConflict {
            task_id: Uuid::nil(),
            operation: "record_part",
            status: "completed".into(),
        };
        assert!(err.to_string().contains("record_part"));
        assert!(err.to_string().contains("completed"));
        assert_eq!(err.kind(), "state_conflict");
        assert_eq!(err.log_level(), LogLevel::Warn);
    }

    #[test]
    fn test_io_error_maps_to_transient() {
        let err: DepotError = std::io::Error::other("broken pipe").into();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "transient_io");
    }
}
