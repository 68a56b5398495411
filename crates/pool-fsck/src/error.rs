use pool_ledger::LedgerError;
use pool_lock::LockError;
use pool_refcnt::RefcntError;
use pool_store::StoreError;

/// Errors produced by the consistency checker.
///
/// Drift and corruption are not errors: they are reported. These are the
/// failures that stop a check from producing a report at all.
#[derive(Debug, thiserror::Error)]
pub enum FsckError {
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("refcnt error: {0}")]
    Refcnt(#[from] RefcntError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for fsck operations.
pub type FsckResult<T> = Result<T, FsckError>;
