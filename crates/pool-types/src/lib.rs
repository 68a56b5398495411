//! Foundation types for the chunk pool.
//!
//! Every other pool crate depends on `pool-types`. It carries no I/O: only
//! identities, ledger records, and the statistics computed by a fold.
//!
//! # Key Types
//!
//! - [`ChunkHash`]: SHA-256 digest of a chunk's uncompressed bytes
//! - [`RefCountRecord`]: one reference-count entry of a ledger
//! - [`UnusedRecord`]: a chunk known on disk with no positive count
//! - [`LedgerRecord`]: tagged union of the two record kinds, as stored on disk
//! - [`ManifestChunk`]: one chunk reference listed by a backup manifest
//! - [`PoolStatistics`]: aggregate counters recomputed by every fold
//! - [`StatisticsEntry`]: timestamped statistics for usage history

pub mod error;
pub mod hash;
pub mod records;
pub mod stats;

pub use error::TypeError;
pub use hash::{ChunkHash, ChunkHasher};
pub use records::{LedgerRecord, ManifestChunk, RefCountRecord, UnusedRecord};
pub use stats::{PoolStatistics, StatisticsEntry};
