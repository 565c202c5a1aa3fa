use std::time::Duration;

use thiserror::Error;

use crate::ports::AdapterKind;

/// Errors raised by a storage adapter.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Timeouts, dropped connections; worth retrying with backoff.
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Fatal(String),

    #[error("operation not supported by this adapter: {0}")]
    Unsupported(&'static str),

    #[error("queue does not exist: {0}")]
    QueueNotFound(String),

    /// Rejected before reaching the backend (validation middleware).
    #[error("invalid storage request: {0}")]
    InvalidRequest(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Invalid configuration, reported when a queue is created or a component is
/// built. Never silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("queue name must not be empty")]
    EmptyQueueName,

    #[error("invalid queue name '{0}': only ASCII letters, digits, '-', '_' and '.' are allowed")]
    InvalidQueueName(String),

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("lease duration must be greater than zero")]
    ZeroLeaseDuration,

    #[error("heartbeat interval {interval:?} must be at most a third of the lease duration {lease:?}")]
    HeartbeatTooSlow { interval: Duration, lease: Duration },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("idle backoff minimum {min:?} exceeds maximum {max:?}")]
    InvalidIdleBackoff { min: Duration, max: Duration },

    #[error("max retries must be at least 1")]
    ZeroMaxRetries,

    #[error("EnableStatusTable requires EnableStatus")]
    StatusTableRequiresStatus,

    #[error("EnableHoldTransactionUntilMessageCommitted cannot be combined with EnableHeartBeat")]
    HoldTransactionWithHeartbeat,

    #[error("EnableHoldTransactionUntilMessageCommitted is not supported by a {0:?} adapter")]
    HoldTransactionUnsupported(AdapterKind),

    #[error("additional column '{0}' is declared more than once")]
    DuplicateColumn(String),
}

/// Error of every facade, producer and consumer operation.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The queue (or creation object) was disposed; distinct from all other failures.
    #[error("queue has been disposed")]
    Disposed,

    #[error("feature disabled for this queue: {0}")]
    FeatureDisabled(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(StorageError::Transient("timeout".into()).is_transient());
        assert!(!StorageError::Fatal("disk".into()).is_transient());
        assert!(!StorageError::Unsupported("x").is_transient());
    }

    #[test]
    fn storage_error_converts_into_queue_error() {
        let err: QueueError = StorageError::QueueNotFound("orders".into()).into();
        assert!(err.to_string().contains("orders"));
    }
}
