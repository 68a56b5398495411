//! Mutual exclusion for chunk pool mutations.
//!
//! Every operation that rewrites a ledger, the unused set, or removes chunk
//! files runs inside [`using`], which holds a lease over named resources and
//! hands the routine an [`AbortSignal`] to poll before committing.
//!
//! Implementations:
//! - [`FileLockService`]: lease files under `<pool>/locks`, shared by
//!   cooperating processes on one filesystem
//! - [`InMemoryLockService`]: single-process, for tests and embedding

pub mod error;
pub mod file;
pub mod memory;
pub mod signal;
pub mod traits;

pub use error::{LockError, LockResult};
pub use file::{FileLockConfig, FileLockService, DEFAULT_LEASE_SECS};
pub use memory::InMemoryLockService;
pub use signal::AbortSignal;
pub use traits::{using, LockLease, LockService};
