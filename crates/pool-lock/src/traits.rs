use std::time::Duration;

use uuid::Uuid;

use crate::error::{LockError, LockResult};
use crate::signal::AbortSignal;

/// A held lock over a set of resources.
#[derive(Debug)]
pub struct LockLease {
    pub id: Uuid,
    pub resources: Vec<String>,
    pub signal: AbortSignal,
}

impl LockLease {
    pub fn new(resources: Vec<String>, signal: AbortSignal) -> Self {
        Self {
            id: Uuid::now_v7(),
            resources,
            signal,
        }
    }
}

/// Mutual exclusion keyed by resource names.
///
/// Implementations must be safe to share between threads and between
/// cooperating processes where they claim to be.
pub trait LockService: Send + Sync {
    /// Acquire every resource in `resources`, waiting at most `timeout`.
    fn acquire(&self, resources: &[String], timeout: Duration) -> LockResult<LockLease>;

    /// Release a lease. Releasing an expired lease is not an error.
    fn release(&self, lease: LockLease) -> LockResult<()>;

    /// Whether any of `resources` is currently held by someone.
    fn is_locked(&self, resources: &[String]) -> LockResult<bool>;
}

/// Run `routine` while holding `resources`.
///
/// The routine receives the lease's abort signal and must check it before
/// committing anything. The lease is released whatever the routine returns.
pub fn using<T, E, F>(
    service: &dyn LockService,
    resources: &[String],
    timeout: Duration,
    routine: F,
) -> Result<T, E>
where
    F: FnOnce(&AbortSignal) -> Result<T, E>,
    E: From<LockError>,
{
    let lease = service.acquire(resources, timeout)?;
    let signal = lease.signal.clone();
    let outcome = routine(&signal);
    let released = service.release(lease);
    let value = outcome?;
    released?;
    Ok(value)
}
