//! Reference-count ledgers for the chunk pool.
//!
//! This crate provides:
//! - Framed, CRC-checked ledger files with atomic replacement
//! - `ReferenceCount` and `PoolLayout` path derivations
//! - `UnusedSet`, the hash-keyed set of unreferenced chunks
//! - The fold (`calculate_ref_count`) that reduces records into one count per hash
//! - Per-ledger statistics history
//!
//! Ledgers are best-effort caches of derivable truth: unreadable ledgers read
//! as empty and are rebuilt by fsck.

pub mod codec;
pub mod error;
pub mod fold;
pub mod paths;
pub mod stats;
pub mod unused;

pub use codec::{read_refcnt, read_unused, write_ledger, LedgerReader, LEDGER_MAGIC, LEDGER_VERSION};
pub use error::{LedgerError, LedgerResult};
pub use fold::{calculate_ref_count, FoldResult, RefCountEntry, RefCountMap};
pub use paths::{
    statistics_path, PoolLayout, ReferenceCount, BACKUP_REFCNT_FILE, HOST_REFCNT_FILE,
    JOURNAL_FILE, POOL_REFCNT_FILE, RETIRED_SUFFIX, UNUSED_FILE,
};
pub use stats::{latest_statistics, read_statistics, record_statistics};
pub use unused::UnusedSet;
