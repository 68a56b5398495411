use tracing::{error, info};

/// Progress sink for long-running pool operations.
///
/// Callers render it however they like (spinner, queue event, log line);
/// operations never assume one.
pub trait Reporter: Send + Sync {
    /// `current` of `max` units done. `max` may be an estimate.
    fn progress(&self, current: u64, max: u64, message: &str);

    /// A problem that did not stop the operation.
    fn error(&self, message: &str);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn progress(&self, _current: u64, _max: u64, _message: &str) {}

    fn error(&self, _message: &str) {}
}

/// Forwards to `tracing`, logging progress every `every` units.
#[derive(Clone, Copy, Debug)]
pub struct TracingReporter {
    every: u64,
}

impl TracingReporter {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Reporter for TracingReporter {
    fn progress(&self, current: u64, max: u64, message: &str) {
        if current % self.every == 0 || current == max {
            info!(current, max, "{message}");
        }
    }

    fn error(&self, message: &str) {
        error!("{message}");
    }
}
