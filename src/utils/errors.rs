use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error surface of the queue core.
///
/// Producer-facing operations return these verbatim; worker loops translate
/// processor errors into state transitions instead of propagating them.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("circuit open for target: {0}")]
    CircuitOpen(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether a worker loop may retry the failed step.
    ///
    /// Backend and timeout failures are transient; validation, conflicts and
    /// open circuits are not. `Internal` bubbles to the supervisor.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Backend(_)
                | QueueError::Timeout(_)
                | QueueError::ResourceExhausted(_)
                | QueueError::Cancelled
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        QueueError::Validation(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        QueueError::Backend(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        QueueError::Internal(msg.into())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            QueueError::Timeout(Duration::from_secs(0))
        } else {
            QueueError::Backend(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(QueueError::backend("connection reset").is_retryable());
        assert!(QueueError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(QueueError::Cancelled.is_retryable());
        assert!(!QueueError::validation("bad priority").is_retryable());
        assert!(!QueueError::CircuitOpen("openai".into()).is_retryable());
        assert!(!QueueError::Conflict("not failed".into()).is_retryable());
    }

    #[test]
    fn serde_errors_map_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let mapped: QueueError = err.into();
        assert!(matches!(mapped, QueueError::Serialization(_)));
    }
}
