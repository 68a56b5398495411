//! Consistency checker (fsck) for the chunk pool.
//!
//! Ledgers are caches of derivable truth. This crate derives that truth again
//! and compares:
//! - reference counts, bottom-up: backup ledgers against manifests, host
//!   ledgers against their backups, the pool ledger against all hosts
//! - the unused set against the pool ledger and the files on disk
//! - every chunk's content against its name
//! - compressed against uncompressed sizes
//!
//! The manifest layer is reached through [`BackupCatalog`].

pub mod catalog;
pub mod checker;
pub mod error;
pub mod report;
pub mod sniff;

pub use catalog::{BackupCatalog, InMemoryCatalog, JsonlCatalog, ManifestChunks, ManifestLine};
pub use checker::ConsistencyChecker;
pub use error::{FsckError, FsckResult};
pub use report::{
    ChunkReport, CompressionAnomaly, CompressionReport, FsckReport, IntegrityReport,
    RefcntMismatch, Scope, UnusedReport,
};
pub use sniff::sniff_content_type;
