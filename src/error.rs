//! Error types for the operation queue

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for the operation queue
pub type Result<T> = std::result::Result<T, Error>;

/// Operation queue errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Admission rejected: the queue is at capacity
    #[error("Queue full - back-pressure activated (capacity {capacity})")]
    QueueFull {
        /// Configured maximum queue size
        capacity: usize,
    },

    /// The request waited longer than its queue-wait timeout
    #[error("Queue timeout exceeded after {waited:?}")]
    QueueTimeout {
        /// Time spent queued in the last admission window
        waited: Duration,
    },

    /// The dispatched operation did not complete in time
    #[error("Execution timeout exceeded ({timeout:?})")]
    ExecutionTimeout {
        /// Execution timeout that elapsed
        timeout: Duration,
    },

    /// Circuit breaker open
    #[error("Circuit breaker open - error rate {error_rate:.4} above {threshold:.4}")]
    CircuitOpen {
        /// Error rate observed at dispatch time
        error_rate: f64,
        /// Configured threshold
        threshold: f64,
    },

    /// Store failure surfaced as a terminal result
    #[error("Operation failed: {0}")]
    Operation(StoreError),

    /// Retries exhausted
    #[error("Max retries exceeded after {retries} retries: {last}")]
    MaxRetriesExceeded {
        /// Number of retries performed
        retries: u32,
        /// Last observed error
        last: Box<Error>,
    },

    /// Submission is malformed and was never admitted
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(String),

    /// Queue shut down before the request completed
    #[error("Queue shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the retry controller may resubmit after this error.
    ///
    /// Admission, queue-timeout and circuit errors are never retried: retrying
    /// them only adds load to a saturated system.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExecutionTimeout { .. } => true,
            Self::Operation(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short stable code used in metrics labels and alert details
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Operation(_) => "operation",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Operation(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(Error::ExecutionTimeout { timeout: Duration::from_secs(1) }.is_retryable());
        assert!(Error::Operation(StoreError::retryable("backend unavailable")).is_retryable());
        assert!(!Error::Operation(StoreError::fatal("bad key")).is_retryable());
        assert!(!Error::QueueFull { capacity: 2 }.is_retryable());
        assert!(!Error::QueueTimeout { waited: Duration::from_secs(1) }.is_retryable());
        assert!(
            !Error::CircuitOpen {
                error_rate: 0.9,
                threshold: 0.5
            }
            .is_retryable()
        );
    }

    #[test]
    fn max_retries_keeps_last_error_detail() {
        let err = Error::MaxRetriesExceeded {
            retries: 3,
            last: Box::new(Error::Operation(StoreError::retryable("network error"))),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 retries"));
        assert!(msg.contains("network error"));
        assert_eq!(err.code(), "max_retries_exceeded");
    }
}
