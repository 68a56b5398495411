use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{LockError, LockResult};

/// Cancellation token carried by a lease.
///
/// Fires when [`abort`](Self::abort) is called on any clone, or when the lease
/// deadline passes. Operations poll it before committing writes.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl AbortSignal {
    /// A signal that only fires on explicit abort.
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// A signal that also fires once `lease` has elapsed.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(lease),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(LockError::Aborted)` once the signal has fired.
    pub fn check(&self) -> LockResult<()> {
        if self.is_aborted() {
            Err(LockError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Time left on the lease, `None` if the signal has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(signal.check().is_ok());
        clone.abort();
        assert!(signal.is_aborted());
        assert!(matches!(signal.check(), Err(LockError::Aborted)));
    }

    #[test]
    fn expired_lease_fires() {
        let signal = AbortSignal::with_lease(Duration::ZERO);
        assert!(signal.is_aborted());
        assert_eq!(signal.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn long_lease_does_not_fire() {
        let signal = AbortSignal::with_lease(Duration::from_secs(3600));
        assert!(!signal.is_aborted());
        assert!(AbortSignal::new().remaining().is_none());
    }
}
