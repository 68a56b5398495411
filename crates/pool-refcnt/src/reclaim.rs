use std::path::{Path, PathBuf};

use pool_ledger::{calculate_ref_count, read_refcnt, read_unused, write_ledger, UnusedSet};
use pool_lock::LockError;
use pool_store::{ChunkStore, StoreError};
use pool_types::LedgerRecord;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::coordinator::{lock_resources, RefcntCoordinator};
use crate::error::RefcntResult;
use crate::reporter::Reporter;

/// What to do with a reclaimed chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReclaimTarget {
    Delete,
    /// Move into this directory, keeping the shard layout.
    Archive(PathBuf),
}

/// Statistics returned by [`RefcntCoordinator::remove_unused_files`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub reclaimed: u64,
    pub reclaimed_size: u64,
    /// Unused entries that the pool ledger still references; kept on disk.
    pub still_referenced: u64,
    /// Unused entries whose file was already gone.
    pub missing: u64,
    pub failed: u64,
}

impl RefcntCoordinator {
    /// Delete or archive every chunk of the unused set.
    ///
    /// Holds the pool ledger and unused ledger locks throughout. A chunk the
    /// pool ledger references is never touched, whatever the unused set says.
    /// On completion the unused ledger keeps only the chunks that could not be
    /// reclaimed. If the lease expires first, the unused ledger is left as it
    /// was and [`LockError::Aborted`] is returned; chunks already removed are
    /// found missing by the next run.
    pub fn remove_unused_files(
        &self,
        store: &dyn ChunkStore,
        pool_ledger: &Path,
        unused_path: &Path,
        target: &ReclaimTarget,
        reporter: &dyn Reporter,
    ) -> RefcntResult<ReclaimReport> {
        let resources = lock_resources(pool_ledger, Some(unused_path));
        pool_lock::using(self.lock_service(), &resources, self.lock_timeout(), |signal| {
            let unused = UnusedSet::from_records(read_unused(unused_path));
            let referenced =
                calculate_ref_count(read_refcnt(pool_ledger).map(LedgerRecord::from), None);

            let total = unused.len() as u64;
            let mut report = ReclaimReport::default();
            let mut remaining = UnusedSet::new();

            for (index, record) in unused.iter().enumerate() {
                if signal.is_aborted() {
                    warn!(
                        done = index,
                        total,
                        reclaimed = report.reclaimed,
                        "reclaim aborted, unused ledger left unchanged"
                    );
                    return Err(LockError::Aborted.into());
                }
                reporter.progress(index as u64 + 1, total, "reclaiming unused chunks");

                if referenced.get(&record.sha256).is_some() {
                    warn!(sha256 = %record.sha256, "unused chunk is still referenced, skipping");
                    report.still_referenced += 1;
                    continue;
                }

                let outcome = match target {
                    ReclaimTarget::Delete => store.remove(&record.sha256),
                    ReclaimTarget::Archive(dir) => store.archive(&record.sha256, dir),
                };
                match outcome {
                    Ok(()) => {
                        debug!(sha256 = %record.sha256, "chunk reclaimed");
                        report.reclaimed += 1;
                        report.reclaimed_size += record.compressed_size;
                    }
                    Err(StoreError::NotFound(_)) => report.missing += 1,
                    Err(e) => {
                        reporter.error(&format!("cannot reclaim {}: {e}", record.sha256));
                        report.failed += 1;
                        remaining.add(*record);
                    }
                }
            }

            signal.check()?;
            write_ledger(unused_path, remaining.to_ledger_records())?;
            info!(
                reclaimed = report.reclaimed,
                reclaimed_size = report.reclaimed_size,
                missing = report.missing,
                failed = report.failed,
                "reclaim done"
            );
            Ok(report)
        })
    }
}
