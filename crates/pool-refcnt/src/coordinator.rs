use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pool_ledger::{
    calculate_ref_count, read_refcnt, read_unused, record_statistics, write_ledger, PoolLayout,
    UnusedSet, JOURNAL_FILE,
};
use pool_lock::{using, AbortSignal, LockService};
use pool_store::ChunkStore;
use pool_types::{LedgerRecord, ManifestChunk, PoolStatistics, RefCountRecord, StatisticsEntry};
use tracing::{debug, error, info, warn};

use crate::error::{RefcntError, RefcntResult};
use crate::tally::tally_manifest_chunks;

/// Default wait for a ledger lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Applies backup additions and removals to host and pool ledgers.
///
/// Every mutation runs under a lock on the ledgers it rewrites, folds fully in
/// memory, checks the lease, and only then replaces the files. A failure at
/// any point leaves the previous ledgers in place.
pub struct RefcntCoordinator {
    lock: Arc<dyn LockService>,
    lock_timeout: Duration,
}

impl RefcntCoordinator {
    pub fn new(lock: Arc<dyn LockService>) -> Self {
        Self {
            lock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_service(&self) -> &dyn LockService {
        self.lock.as_ref()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Fold a new backup's records into `target`.
    ///
    /// With no backup the existing ledger is just re-folded, which compacts it
    /// and refreshes its statistics. `timestamp` stamps the statistics entry
    /// (defaults to now) so history can be rebuilt for past dates.
    pub fn add_backup_refcnt_to(
        &self,
        target: &Path,
        new_backup: Option<&Path>,
        unused: Option<&Path>,
        timestamp: Option<DateTime<Utc>>,
    ) -> RefcntResult<PoolStatistics> {
        let outcome = self.locked(target, unused, |signal| {
            let existing = read_refcnt(target);
            let added = new_backup.into_iter().flat_map(read_refcnt);
            fold_into(target, existing.chain(added), unused, timestamp, signal)
        });
        log_outcome("add backup refcnt", target, &outcome);
        outcome
    }

    /// Subtract a backup's records from `target`.
    ///
    /// The existing ledger is the baseline; the backup ledger is folded in
    /// negated, cancelling exactly what adding it contributed.
    pub fn remove_backup_refcnt_to(
        &self,
        target: &Path,
        backup_ledger: &Path,
        unused: Option<&Path>,
    ) -> RefcntResult<PoolStatistics> {
        let outcome = self.locked(target, unused, |signal| {
            let existing = read_refcnt(target);
            let removed = read_refcnt(backup_ledger).map(RefCountRecord::negated);
            fold_into(target, existing.chain(removed), unused, None, signal)
        });
        log_outcome("remove backup refcnt", target, &outcome);
        outcome
    }

    /// Force `path` to hold exactly `recomputed`.
    ///
    /// A journal next to the ledger receives the recomputed records followed
    /// by every existing record negated; folding ledger and journal together
    /// zeroes stale entries and leaves the recomputed counts. Entries that drop
    /// out move to `unused` when given.
    pub fn fix_refcnt<I>(
        &self,
        recomputed: I,
        path: &Path,
        unused: Option<&Path>,
    ) -> RefcntResult<PoolStatistics>
    where
        I: IntoIterator<Item = RefCountRecord>,
    {
        let journal = journal_path(path);
        let outcome = self.locked(path, unused, |signal| {
            let reversal = read_refcnt(path).map(RefCountRecord::negated);
            let count = write_ledger(
                &journal,
                recomputed.into_iter().chain(reversal).map(LedgerRecord::from),
            )?;
            debug!(journal = ?journal, records = count, "fix journal written");

            let stats = fold_into(
                path,
                read_refcnt(&journal).chain(read_refcnt(path)),
                unused,
                None,
                signal,
            );
            remove_journal(&journal);
            stats
        });
        log_outcome("fix refcnt", path, &outcome);
        outcome
    }

    /// Write the ledger of a completed backup from its manifest references.
    ///
    /// A backup ledger is written once; an existing one is never replaced.
    pub fn create_backup_refcnt<I>(
        &self,
        store: &dyn ChunkStore,
        backup_ledger: &Path,
        chunks: I,
    ) -> RefcntResult<PoolStatistics>
    where
        I: IntoIterator<Item = ManifestChunk>,
    {
        let outcome = self.locked(backup_ledger, None, |signal| {
            if backup_ledger.exists() {
                return Err(RefcntError::BackupExists(backup_ledger.to_path_buf()));
            }
            let tally = tally_manifest_chunks(chunks, store);
            let records: Vec<_> = tally.fold.records().collect();
            fold_into(backup_ledger, records.into_iter(), None, None, signal)
        });
        log_outcome("create backup refcnt", backup_ledger, &outcome);
        outcome
    }

    /// Take a backup out of the pool.
    ///
    /// The backup directory is first renamed aside so that it no longer counts
    /// as a backup of the host. Its ledger is then subtracted from the host
    /// ledger and from the pool ledger, and the renamed directory is deleted.
    /// Returns the pool statistics after removal.
    pub fn remove_backup(
        &self,
        layout: &PoolLayout,
        host: &str,
        number: u32,
    ) -> RefcntResult<PoolStatistics> {
        let live = layout.reference_count(host, number);
        if !live.backup_path.exists() {
            return Err(RefcntError::MissingBackup(live.backup_path));
        }
        let paths = layout.retire_backup(host, number)?;
        self.remove_backup_refcnt_to(&paths.host_path, &paths.backup_path, None)?;
        let stats = self.remove_backup_refcnt_to(
            &paths.pool_path,
            &paths.backup_path,
            Some(&paths.unused_pool_path),
        )?;
        layout.purge_retired_backup(host, number)?;
        info!(host, number, nb_ref = stats.nb_ref, "backup removed");
        Ok(stats)
    }

    fn locked<T>(
        &self,
        ledger: &Path,
        unused: Option<&Path>,
        routine: impl FnOnce(&AbortSignal) -> RefcntResult<T>,
    ) -> RefcntResult<T> {
        let resources = lock_resources(ledger, unused);
        using(self.lock.as_ref(), &resources, self.lock_timeout, routine)
    }
}

/// Lock names for a mutation of `ledger` and, optionally, the unused set.
///
/// Names are absolute, with the parent directory canonicalized when it
/// exists, so every spelling of a ledger path takes the same lock.
pub fn lock_resources(ledger: &Path, unused: Option<&Path>) -> Vec<String> {
    let mut resources = vec![lock_name(ledger)];
    if let Some(unused) = unused {
        resources.push(lock_name(unused));
    }
    resources
}

fn lock_name(path: &Path) -> String {
    let canonical = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        })
        .map(|dir| dir.join(name))
        .ok(),
        _ => None,
    };
    canonical
        .or_else(|| std::path::absolute(path).ok())
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

/// Scratch ledger used while `ledger` is being rewritten.
pub fn journal_path(ledger: &Path) -> PathBuf {
    ledger.with_file_name(JOURNAL_FILE)
}

/// Fold `records` (plus the unused ledger when given), then replace the
/// ledger, the unused ledger and append statistics. Nothing is written unless
/// the fold completed and the lease is still valid.
fn fold_into<I>(
    target: &Path,
    records: I,
    unused: Option<&Path>,
    timestamp: Option<DateTime<Utc>>,
    signal: &AbortSignal,
) -> RefcntResult<PoolStatistics>
where
    I: Iterator<Item = RefCountRecord>,
{
    let mut unused_set = unused.map(|path| UnusedSet::from_records(read_unused(path)));
    let result = calculate_ref_count(records.map(LedgerRecord::from), unused_set.as_mut());

    signal.check()?;
    write_ledger(target, result.records().map(LedgerRecord::from))?;
    if let (Some(path), Some(set)) = (unused, &unused_set) {
        write_ledger(path, set.to_ledger_records())?;
    }

    let entry = StatisticsEntry::new(timestamp.unwrap_or_else(Utc::now), result.statistics);
    if let Err(e) = record_statistics(target, entry) {
        warn!(ledger = ?target, error = %e, "cannot record statistics");
    }
    Ok(result.statistics)
}

fn remove_journal(journal: &Path) {
    match fs::remove_file(journal) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(journal = ?journal, error = %e, "cannot remove fix journal"),
    }
}

fn log_outcome(operation: &str, ledger: &Path, outcome: &RefcntResult<PoolStatistics>) {
    match outcome {
        Ok(stats) => info!(
            ledger = ?ledger,
            nb_chunk = stats.nb_chunk,
            nb_ref = stats.nb_ref,
            unused_size = stats.unused_size,
            "{operation} done"
        ),
        Err(e) => error!(ledger = ?ledger, error = %e, "{operation} abandoned"),
    }
}

impl std::fmt::Debug for RefcntCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefcntCoordinator")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_ledger::read_statistics;
    use pool_lock::{InMemoryLockService, LockError};
    use pool_store::{ChunkStoreConfig, FsChunkStore};
    use pool_types::ChunkHash;

    fn coordinator() -> RefcntCoordinator {
        RefcntCoordinator::new(Arc::new(InMemoryLockService::new()))
            .with_lock_timeout(Duration::from_millis(50))
    }

    fn rc(seed: &[u8], count: i64) -> RefCountRecord {
        RefCountRecord::new(ChunkHash::of(seed), count, seed.len() as u64, 3)
    }

    fn write(path: &Path, records: &[RefCountRecord]) {
        write_ledger(path, records.iter().copied().map(LedgerRecord::from)).unwrap();
    }

    fn counts(path: &Path) -> Vec<(ChunkHash, i64)> {
        let mut counts: Vec<_> = read_refcnt(path).map(|r| (r.sha256, r.ref_count)).collect();
        counts.sort();
        counts
    }

    #[test]
    fn add_then_remove_restores_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let pool = dir.path().join("REFCNT.pool.bin");
        let unused = dir.path().join("UNUSED.pool.bin");
        let first = dir.path().join("first.bin");
        let second = dir.path().join("second.bin");
        write(&first, &[rc(b"a", 1), rc(b"b", 2)]);
        write(&second, &[rc(b"b", 1), rc(b"c", 1)]);

        let coordinator = coordinator();
        coordinator.add_backup_refcnt_to(&pool, Some(&first), Some(&unused), None).unwrap();
        let before = counts(&pool);

        let stats = coordinator
            .add_backup_refcnt_to(&pool, Some(&second), Some(&unused), None)
            .unwrap();
        assert_eq!(stats.nb_chunk, 3);
        assert_eq!(stats.nb_ref, 5);
        assert_eq!(stats.longest_chain, 3);

        coordinator.remove_backup_refcnt_to(&pool, &second, Some(&unused)).unwrap();
        assert_eq!(counts(&pool), before);

        let unused_set = UnusedSet::from_records(read_unused(&unused));
        assert!(unused_set.has(&ChunkHash::of(b"c")));
        assert!(!unused_set.has(&ChunkHash::of(b"b")));
    }

    #[test]
    fn re_adding_removes_from_unused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = dir.path().join("REFCNT.pool.bin");
        let unused = dir.path().join("UNUSED.pool.bin");
        let backup = dir.path().join("backup.bin");
        write(&backup, &[rc(b"a", 1)]);

        let coordinator = coordinator();
        coordinator.add_backup_refcnt_to(&pool, Some(&backup), Some(&unused), None).unwrap();
        coordinator.remove_backup_refcnt_to(&pool, &backup, Some(&unused)).unwrap();
        assert_eq!(read_unused(&unused).count(), 1);

        coordinator.add_backup_refcnt_to(&pool, Some(&backup), Some(&unused), None).unwrap();
        assert_eq!(read_unused(&unused).count(), 0);
        assert_eq!(counts(&pool), vec![(ChunkHash::of(b"a"), 1)]);
    }

    #[test]
    fn statistics_use_given_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let pool = dir.path().join("REFCNT.pool.bin");
        let backup = dir.path().join("backup.bin");
        write(&backup, &[rc(b"a", 2)]);
        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        coordinator().add_backup_refcnt_to(&pool, Some(&backup), None, Some(at)).unwrap();
        let history = read_statistics(&pool);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, at);
        assert_eq!(history[0].statistics.nb_ref, 2);
    }

    #[test]
    fn fix_replaces_counts_and_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("REFCNT.host.bin");
        let unused = dir.path().join("UNUSED.pool.bin");
        write(&host, &[rc(b"a", 5), rc(b"stale", 1)]);

        coordinator()
            .fix_refcnt(vec![rc(b"a", 2), rc(b"b", 1)], &host, Some(&unused))
            .unwrap();

        let mut expected = vec![(ChunkHash::of(b"a"), 2), (ChunkHash::of(b"b"), 1)];
        expected.sort();
        assert_eq!(counts(&host), expected);
        assert!(!journal_path(&host).exists());
        assert!(UnusedSet::from_records(read_unused(&unused)).has(&ChunkHash::of(b"stale")));
    }

    #[test]
    fn lock_timeout_leaves_ledger_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let pool = dir.path().join("REFCNT.pool.bin");
        let backup = dir.path().join("backup.bin");
        write(&pool, &[rc(b"a", 1)]);
        write(&backup, &[rc(b"b", 1)]);

        let locks = Arc::new(InMemoryLockService::new());
        let coordinator = RefcntCoordinator::new(locks.clone())
            .with_lock_timeout(Duration::from_millis(10));
        let _held = locks
            .acquire(&lock_resources(&pool, None), Duration::from_secs(1))
            .unwrap();

        let err = coordinator
            .add_backup_refcnt_to(&pool, Some(&backup), None, None)
            .unwrap_err();
        assert!(matches!(err, RefcntError::Lock(LockError::Timeout { .. })));
        assert_eq!(counts(&pool), vec![(ChunkHash::of(b"a"), 1)]);
    }

    #[test]
    fn aborted_lease_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = dir.path().join("REFCNT.pool.bin");
        write(&pool, &[rc(b"a", 1)]);

        let signal = AbortSignal::new();
        signal.abort();
        let err = fold_into(&pool, vec![rc(b"b", 1)].into_iter(), None, None, &signal).unwrap_err();
        assert!(matches!(err, RefcntError::Lock(LockError::Aborted)));
        assert_eq!(counts(&pool), vec![(ChunkHash::of(b"a"), 1)]);
    }

    #[test]
    fn backup_ledger_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(&dir.path().join("pool"), ChunkStoreConfig::default()).unwrap();
        let a = store.write_bytes(b"alpha").unwrap();
        let backup = dir.path().join("web").join("1").join("REFCNT.backup.bin");
        let chunks = || vec![ManifestChunk::new(a.sha256, a.size, "/a")];

        let coordinator = coordinator();
        coordinator.create_backup_refcnt(&store, &backup, chunks()).unwrap();
        let err = coordinator
            .create_backup_refcnt(&store, &backup, chunks().into_iter().chain(chunks()))
            .unwrap_err();
        assert!(matches!(err, RefcntError::BackupExists(ref path) if path == &backup));
        assert_eq!(counts(&backup), vec![(a.sha256, 1)]);
    }

    #[test]
    fn removed_backup_leaves_the_host() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PoolLayout::new(dir.path().join("pool"), dir.path().join("hosts"));
        let paths = layout.reference_count("web", 1);
        write(&paths.backup_path, &[rc(b"a", 2)]);

        let coordinator = coordinator();
        coordinator.add_backup_refcnt_to(&paths.host_path, Some(&paths.backup_path), None, None).unwrap();
        coordinator
            .add_backup_refcnt_to(&paths.pool_path, Some(&paths.backup_path), Some(&paths.unused_pool_path), None)
            .unwrap();

        let stats = coordinator.remove_backup(&layout, "web", 1).unwrap();
        assert_eq!(stats.nb_ref, 0);
        assert!(layout.backups("web").unwrap().is_empty());
        assert!(!layout.retired_backup_dir("web", 1).exists());
        assert!(counts(&paths.host_path).is_empty());
        assert!(counts(&paths.pool_path).is_empty());
        assert!(UnusedSet::from_records(read_unused(&paths.unused_pool_path)).has(&ChunkHash::of(b"a")));

        let err = coordinator.remove_backup(&layout, "web", 1).unwrap_err();
        assert!(matches!(err, RefcntError::MissingBackup(_)));
    }

    #[test]
    fn lock_names_ignore_path_spelling() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pool")).unwrap();
        let plain = dir.path().join("pool").join("REFCNT.pool.bin");
        let dotted = dir.path().join("pool").join("..").join("pool").join("REFCNT.pool.bin");

        assert_eq!(lock_resources(&plain, None), lock_resources(&dotted, None));
        assert!(Path::new(&lock_resources(&plain, None)[0]).is_absolute());
        assert!(Path::new(&lock_resources(Path::new("REFCNT.pool.bin"), None)[0]).is_absolute());
    }
}
