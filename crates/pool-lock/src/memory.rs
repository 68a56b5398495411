//! In-process lock service for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{LockError, LockResult};
use crate::signal::AbortSignal;
use crate::traits::{LockLease, LockService};

/// A [`LockService`] backed by a mutex-protected map.
///
/// Leases never expire on their own; callers abort them explicitly.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    held: Mutex<HashMap<String, Uuid>>,
    released: Condvar,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> LockError {
    LockError::Poisoned(e.to_string())
}

impl LockService for InMemoryLockService {
    fn acquire(&self, resources: &[String], timeout: Duration) -> LockResult<LockLease> {
        let started = Instant::now();
        let mut held = self.held.lock().map_err(poisoned)?;
        loop {
            if resources.iter().all(|r| !held.contains_key(r)) {
                let mut ordered = resources.to_vec();
                ordered.sort();
                ordered.dedup();
                let lease = LockLease::new(ordered, AbortSignal::new());
                for resource in &lease.resources {
                    held.insert(resource.clone(), lease.id);
                }
                return Ok(lease);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    resources: resources.to_vec(),
                    waited,
                });
            }
            held = self
                .released
                .wait_timeout(held, timeout - waited)
                .map_err(poisoned)?
                .0;
        }
    }

    fn release(&self, lease: LockLease) -> LockResult<()> {
        let mut held = self.held.lock().map_err(poisoned)?;
        for resource in &lease.resources {
            if held.get(resource) == Some(&lease.id) {
                held.remove(resource);
            }
        }
        self.released.notify_all();
        Ok(())
    }

    fn is_locked(&self, resources: &[String]) -> LockResult<bool> {
        let held = self.held.lock().map_err(poisoned)?;
        Ok(resources.iter().any(|r| held.contains_key(r)))
    }
}
