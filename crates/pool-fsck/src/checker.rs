use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use pool_ledger::{
    calculate_ref_count, read_refcnt, read_unused, write_ledger, FoldResult, PoolLayout,
    RefCountMap, UnusedSet,
};
use pool_lock::{using, AbortSignal, LockError};
use pool_refcnt::{lock_resources, tally_manifest_chunks, RefcntCoordinator, Reporter};
use pool_store::ChunkStore;
use pool_types::{ChunkHash, LedgerRecord, UnusedRecord};
use tracing::{debug, info, warn};

use crate::catalog::BackupCatalog;
use crate::error::FsckResult;
use crate::report::{
    ChunkReport, CompressionAnomaly, CompressionReport, FsckReport, IntegrityReport,
    RefcntMismatch, Scope, UnusedReport,
};
use crate::sniff::sniff_content_type;

/// Anomalies kept in a compression report; the rest are only counted.
const MAX_ANOMALIES: usize = 100;
/// Bytes read from a chunk to guess its content type.
const SNIFF_WINDOW: u64 = 512;

/// Recomputes pool bookkeeping from the manifest layer and the files on disk,
/// and compares it with the stored ledgers.
///
/// Every check is read-only with `dry_run`. Otherwise drifting ledgers are
/// rewritten under the same locks the coordinator uses.
pub struct ConsistencyChecker {
    layout: PoolLayout,
    store: Arc<dyn ChunkStore>,
    catalog: Arc<dyn BackupCatalog>,
    coordinator: RefcntCoordinator,
    cancel: AbortSignal,
}

impl ConsistencyChecker {
    pub fn new(
        layout: PoolLayout,
        store: Arc<dyn ChunkStore>,
        catalog: Arc<dyn BackupCatalog>,
        coordinator: RefcntCoordinator,
    ) -> Self {
        Self {
            layout,
            store,
            catalog,
            coordinator,
            cancel: AbortSignal::new(),
        }
    }

    /// Use `cancel` to stop long scans from outside.
    pub fn with_cancel(mut self, cancel: AbortSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    // ── Reference counts ─────────────────────────────────────────────────

    /// Compare a backup ledger with a tally of its manifests.
    pub fn check_backup_integrity(
        &self,
        host: &str,
        number: u32,
        reporter: &dyn Reporter,
        dry_run: bool,
    ) -> FsckResult<IntegrityReport> {
        let ledger = self.layout.reference_count(host, number).backup_path;

        let mut failure = None;
        let chunks = self
            .catalog
            .list_chunks(host, number)?
            .map_while(|chunk| chunk.map_err(|e| failure = Some(e)).ok());
        let tally = tally_manifest_chunks(chunks, self.store.as_ref());
        if let Some(e) = failure {
            return Err(e);
        }

        let stored = fold_ledger(&ledger);
        let mismatches = compare(&stored.refcnt, &tally.fold.refcnt, |sha256| {
            tally.filenames(sha256).to_vec()
        });
        self.finish_level(
            Scope::Backup {
                host: host.to_string(),
                number,
            },
            &ledger,
            &stored,
            &tally.fold,
            mismatches,
            None,
            reporter,
            dry_run,
        )
    }

    /// Compare a host ledger with the fold of its backup ledgers.
    pub fn check_host_integrity(
        &self,
        host: &str,
        reporter: &dyn Reporter,
        dry_run: bool,
    ) -> FsckResult<IntegrityReport> {
        let ledger = self.layout.host_ledger_path(host);
        let backups: Vec<_> = self
            .catalog
            .backups(host)?
            .into_iter()
            .map(|number| self.layout.reference_count(host, number).backup_path)
            .collect();
        let truth = fold_ledgers(&backups);

        let stored = fold_ledger(&ledger);
        let mismatches = compare(&stored.refcnt, &truth.refcnt, |_| Vec::new());
        self.finish_level(
            Scope::Host {
                host: host.to_string(),
            },
            &ledger,
            &stored,
            &truth,
            mismatches,
            None,
            reporter,
            dry_run,
        )
    }

    /// Compare the pool ledger with the fold of every host ledger.
    pub fn check_pool_integrity(
        &self,
        reporter: &dyn Reporter,
        dry_run: bool,
    ) -> FsckResult<IntegrityReport> {
        let ledger = self.layout.pool_ledger_path();
        let hosts: Vec<_> = self
            .catalog
            .hosts()?
            .iter()
            .map(|host| self.layout.host_ledger_path(host))
            .collect();
        let truth = fold_ledgers(&hosts);

        let stored = fold_ledger(&ledger);
        let mismatches = compare(&stored.refcnt, &truth.refcnt, |_| Vec::new());
        let unused = self.layout.unused_path();
        self.finish_level(
            Scope::Pool,
            &ledger,
            &stored,
            &truth,
            mismatches,
            Some(&unused),
            reporter,
            dry_run,
        )
    }

    /// Every backup, then every host, then the pool, so that a repaired
    /// level is what the next level up is recomputed from.
    pub fn check_all_integrity(
        &self,
        reporter: &dyn Reporter,
        dry_run: bool,
    ) -> FsckResult<FsckReport> {
        let mut report = FsckReport::default();
        for host in self.catalog.hosts()? {
            for number in self.catalog.backups(&host)? {
                if self.cancel.is_aborted() {
                    report.aborted = true;
                    return Ok(report);
                }
                report
                    .levels
                    .push(self.check_backup_integrity(&host, number, reporter, dry_run)?);
            }
            if self.cancel.is_aborted() {
                report.aborted = true;
                return Ok(report);
            }
            report
                .levels
                .push(self.check_host_integrity(&host, reporter, dry_run)?);
        }
        if self.cancel.is_aborted() {
            report.aborted = true;
            return Ok(report);
        }
        report.levels.push(self.check_pool_integrity(reporter, dry_run)?);
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_level(
        &self,
        scope: Scope,
        ledger: &Path,
        stored: &FoldResult,
        truth: &FoldResult,
        mismatches: Vec<RefcntMismatch>,
        unused: Option<&Path>,
        reporter: &dyn Reporter,
        dry_run: bool,
    ) -> FsckResult<IntegrityReport> {
        let checked = stored
            .refcnt
            .keys()
            .chain(truth.refcnt.keys())
            .collect::<BTreeSet<_>>()
            .len() as u64;
        reporter.progress(checked, checked, &format!("checked {scope}"));

        for mismatch in &mismatches {
            reporter.error(&format!(
                "{scope}: {} has refcnt {} but {} expected",
                mismatch.sha256, mismatch.original_refcnt, mismatch.new_refcnt
            ));
        }

        let mut fixed = false;
        if !mismatches.is_empty() && !dry_run {
            self.cancel.check()?;
            self.coordinator
                .fix_refcnt(truth.records(), ledger, unused)?;
            fixed = true;
            info!(scope = %scope, mismatches = mismatches.len(), "ledger repaired");
        } else {
            debug!(scope = %scope, checked, mismatches = mismatches.len(), "ledger checked");
        }

        Ok(IntegrityReport {
            scope,
            ledger: ledger.to_path_buf(),
            checked,
            mismatches,
            fixed,
        })
    }

    // ── Unused set ───────────────────────────────────────────────────────

    /// Classify every chunk on disk against the pool ledger and unused set.
    ///
    /// Without `dry_run` the unused set is repaired: referenced chunks leave
    /// it, orphans and unknown files join it, entries without a file are
    /// dropped. Chunks the ledger references but that are missing on disk are
    /// only reported.
    pub fn process_unused(&self, reporter: &dyn Reporter, dry_run: bool) -> FsckResult<UnusedReport> {
        let pool = self.layout.pool_ledger_path();
        let unused = self.layout.unused_path();
        let resources = lock_resources(&pool, Some(&unused));

        if dry_run {
            if self.coordinator.lock_service().is_locked(&resources)? {
                warn!("pool ledgers are being rewritten; counts may be transient");
            }
            return self.scan_unused(&pool, &unused, reporter, None);
        }

        using(
            self.coordinator.lock_service(),
            &resources,
            self.coordinator.lock_timeout(),
            |lease| self.scan_unused(&pool, &unused, reporter, Some(lease)),
        )
    }

    fn scan_unused(
        &self,
        pool: &Path,
        unused_path: &Path,
        reporter: &dyn Reporter,
        lease: Option<&AbortSignal>,
    ) -> FsckResult<UnusedReport> {
        let refcnt = fold_ledger(pool);
        let mut unused = UnusedSet::from_records(read_unused(unused_path));
        let max = refcnt.statistics.nb_chunk;
        let mut report = UnusedReport::default();
        let mut on_disk = BTreeSet::new();
        let mut changed = false;

        for (index, entry) in self.store.list_all().enumerate() {
            if let Some(lease) = lease {
                if lease.is_aborted() {
                    warn!(done = index, "lease expired during unused check, nothing written");
                    return Err(LockError::Aborted.into());
                }
            }
            if self.cancel.is_aborted() {
                report.aborted = true;
                warn!(done = index, "unused check aborted, nothing written");
                return Ok(report);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    reporter.error(&format!("cannot list chunk: {e}"));
                    continue;
                }
            };
            reporter.progress(index as u64 + 1, max, "checking unused chunks");
            on_disk.insert(entry.sha256);

            match (refcnt.get(&entry.sha256).is_some(), unused.has(&entry.sha256)) {
                (true, false) => report.in_refcnt += 1,
                (false, true) => report.in_unused += 1,
                (true, true) => {
                    report.in_both += 1;
                    reporter.error(&format!("{} is referenced and marked unused", entry.sha256));
                    if lease.is_some() {
                        unused.delete(&entry.sha256);
                        changed = true;
                    }
                }
                (false, false) => {
                    report.in_nothing += 1;
                    reporter.error(&format!("{} is not tracked by any ledger", entry.sha256));
                    if lease.is_some() {
                        let size = self.store.info(&entry.sha256).map(|i| i.size).unwrap_or(0);
                        unused.add(UnusedRecord::new(entry.sha256, size, entry.compressed_size));
                        changed = true;
                    }
                }
            }
        }

        for sha256 in refcnt.refcnt.keys().filter(|h| !on_disk.contains(*h)) {
            report.missing += 1;
            reporter.error(&format!("{sha256} is referenced but missing from the pool"));
        }

        let stale: Vec<ChunkHash> = unused
            .iter()
            .map(|r| r.sha256)
            .filter(|h| !on_disk.contains(h))
            .collect();
        report.stale_unused = stale.len() as u64;
        if let Some(lease) = lease {
            for sha256 in &stale {
                unused.delete(sha256);
                changed = true;
            }
            if changed {
                lease.check()?;
                self.cancel.check()?;
                write_ledger(unused_path, unused.to_ledger_records())?;
                report.repaired = true;
            }
        }

        info!(
            in_unused = report.in_unused,
            in_refcnt = report.in_refcnt,
            in_nothing = report.in_nothing,
            in_both = report.in_both,
            missing = report.missing,
            stale_unused = report.stale_unused,
            "unused check done"
        );
        Ok(report)
    }

    // ── Chunk content ────────────────────────────────────────────────────

    /// Decompress and re-hash every chunk on disk.
    pub fn process_verify_chunk(&self, reporter: &dyn Reporter) -> FsckResult<ChunkReport> {
        let max = fold_ledger(&self.layout.pool_ledger_path()).statistics.nb_chunk
            + read_unused(&self.layout.unused_path()).count() as u64;
        let mut report = ChunkReport::default();

        for (index, entry) in self.store.list_all().enumerate() {
            if self.cancel.is_aborted() {
                report.aborted = true;
                break;
            }
            reporter.progress(index as u64 + 1, max, "verifying chunks");
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    reporter.error(&format!("cannot list chunk: {e}"));
                    continue;
                }
            };
            match self.store.verify(&entry.sha256) {
                Ok(true) => report.ok += 1,
                Ok(false) => {
                    reporter.error(&format!("{} is corrupted", entry.sha256));
                    report.corrupted.push(entry.sha256);
                }
                Err(e) => {
                    reporter.error(&format!("{} cannot be read: {e}", entry.sha256));
                    report.corrupted.push(entry.sha256);
                }
            }
        }

        info!(ok = report.ok, corrupted = report.corrupted.len(), "chunk verification done");
        Ok(report)
    }

    // ── Compression ──────────────────────────────────────────────────────

    /// Sum content and on-disk sizes.
    ///
    /// With `all` every file on disk is decompressed to measure it; otherwise
    /// the sizes recorded in the pool ledger are used.
    pub fn check_compression(&self, reporter: &dyn Reporter, all: bool) -> FsckResult<CompressionReport> {
        let ledger = fold_ledger(&self.layout.pool_ledger_path());
        let max = ledger.statistics.nb_chunk;
        let mut audit = CompressionAudit::default();

        if all {
            for (index, entry) in self.store.list_all().enumerate() {
                if self.cancel.is_aborted() {
                    audit.report.aborted = true;
                    break;
                }
                reporter.progress(index as u64 + 1, max, "measuring chunks");
                let info = match entry.and_then(|e| self.store.info(&e.sha256)) {
                    Ok(info) => info,
                    Err(e) => {
                        reporter.error(&format!("cannot measure chunk: {e}"));
                        continue;
                    }
                };
                audit.add(self.store.as_ref(), info.sha256, info.size, info.compressed_size);
            }
        } else {
            for (index, record) in ledger.records().enumerate() {
                if self.cancel.is_aborted() {
                    audit.report.aborted = true;
                    break;
                }
                reporter.progress(index as u64 + 1, max, "summing ledger sizes");
                audit.add(self.store.as_ref(), record.sha256, record.size, record.compressed_size);
            }
        }

        let report = audit.report;
        info!(
            chunks = report.chunks,
            size = report.size,
            compressed_size = report.compressed_size,
            anomalies = report.anomalies.len(),
            "compression check done"
        );
        Ok(report)
    }
}

#[derive(Default)]
struct CompressionAudit {
    report: CompressionReport,
    anomalous: bool,
}

impl CompressionAudit {
    fn add(&mut self, store: &dyn ChunkStore, sha256: ChunkHash, size: u64, compressed_size: u64) {
        let report = &mut self.report;
        report.chunks += 1;
        report.size += size;
        report.compressed_size += compressed_size;
        if compressed_size > size {
            report.expanded_chunks += 1;
        }

        // Record the points where the running totals cross over.
        let anomalous = report.compressed_size > report.size;
        if anomalous && !self.anomalous && report.anomalies.len() < MAX_ANOMALIES {
            let content_type = sniff_chunk(store, &sha256);
            warn!(
                sha256 = %sha256,
                size = report.size,
                compressed_size = report.compressed_size,
                content_type = content_type.unwrap_or("unknown"),
                "pool compressed size exceeds content size"
            );
            report.anomalies.push(CompressionAnomaly {
                sha256,
                size,
                compressed_size,
                cumulative_size: report.size,
                cumulative_compressed_size: report.compressed_size,
                content_type,
            });
        }
        self.anomalous = anomalous;
    }
}

fn sniff_chunk(store: &dyn ChunkStore, sha256: &ChunkHash) -> Option<&'static str> {
    let reader = store.read(sha256).ok()?;
    let mut head = Vec::with_capacity(SNIFF_WINDOW as usize);
    reader.take(SNIFF_WINDOW).read_to_end(&mut head).ok()?;
    Some(sniff_content_type(&head))
}

fn fold_ledger(path: &Path) -> FoldResult {
    calculate_ref_count(read_refcnt(path).map(LedgerRecord::from), None)
}

fn fold_ledgers(paths: &[impl AsRef<Path>]) -> FoldResult {
    calculate_ref_count(
        paths
            .iter()
            .flat_map(|p| read_refcnt(p.as_ref()))
            .map(LedgerRecord::from),
        None,
    )
}

/// Hashes whose stored and recomputed counts differ, in hash order.
fn compare(
    stored: &RefCountMap,
    truth: &RefCountMap,
    filenames: impl Fn(&ChunkHash) -> Vec<String>,
) -> Vec<RefcntMismatch> {
    let hashes: BTreeSet<&ChunkHash> = stored.keys().chain(truth.keys()).collect();
    hashes
        .into_iter()
        .filter_map(|sha256| {
            let original = stored.get(sha256).map_or(0, |e| e.ref_count);
            let expected = truth.get(sha256).map_or(0, |e| e.ref_count);
            (original != expected).then(|| RefcntMismatch {
                sha256: *sha256,
                original_refcnt: original,
                new_refcnt: expected,
                filenames: filenames(sha256),
            })
        })
        .collect()
}

impl std::fmt::Debug for ConsistencyChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyChecker")
            .field("layout", &self.layout)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
