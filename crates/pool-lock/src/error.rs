use std::time::Duration;

/// Errors produced by lock services.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {resources:?}")]
    Timeout {
        resources: Vec<String>,
        waited: Duration,
    },

    #[error("lock lease expired or was aborted")]
    Aborted,

    #[error("lock state poisoned: {0}")]
    Poisoned(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;
