//! Reference-count coordination for the chunk pool.
//!
//! [`RefcntCoordinator`] applies backup additions and removals to host and
//! pool ledgers, writes backup ledgers from manifest references, forces a
//! ledger to recomputed counts for fsck, and reclaims unused chunk files.
//! Every mutation happens under a [`pool_lock::LockService`] lease.

pub mod coordinator;
pub mod error;
pub mod reclaim;
pub mod reporter;
pub mod tally;

pub use coordinator::{journal_path, lock_resources, RefcntCoordinator, DEFAULT_LOCK_TIMEOUT};
pub use error::{RefcntError, RefcntResult};
pub use reclaim::{ReclaimReport, ReclaimTarget};
pub use reporter::{NoopReporter, Reporter, TracingReporter};
pub use tally::{tally_manifest_chunks, ManifestTally};
