use std::path::PathBuf;

use pool_ledger::LedgerError;
use pool_lock::LockError;
use pool_store::StoreError;

/// Errors produced by reference-count coordination.
#[derive(Debug, thiserror::Error)]
pub enum RefcntError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("backup ledger already exists: {0:?}")]
    BackupExists(PathBuf),

    #[error("no backup ledger at {0:?}")]
    MissingBackup(PathBuf),
}

/// Result alias for reference-count operations.
pub type RefcntResult<T> = Result<T, RefcntError>;
