use std::path::PathBuf;

use pool_types::ChunkHash;
use serde::Serialize;

/// One hash whose stored count differs from the recomputed one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RefcntMismatch {
    pub sha256: ChunkHash,
    /// Count in the stored ledger, 0 if absent.
    pub original_refcnt: i64,
    /// Recomputed count, 0 if the ledger has an entry nothing references.
    pub new_refcnt: i64,
    /// Files referencing the chunk; only known at backup level.
    pub filenames: Vec<String>,
}

/// Level of a reference-count check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum Scope {
    Backup { host: String, number: u32 },
    Host { host: String },
    Pool,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup { host, number } => write!(f, "backup {host}/{number}"),
            Self::Host { host } => write!(f, "host {host}"),
            Self::Pool => write!(f, "pool"),
        }
    }
}

/// Outcome of one reference-count check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub scope: Scope,
    pub ledger: PathBuf,
    /// Distinct hashes compared.
    pub checked: u64,
    pub mismatches: Vec<RefcntMismatch>,
    /// The ledger was rewritten to the recomputed counts.
    pub fixed: bool,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Outcome of [`check_all_integrity`](crate::ConsistencyChecker::check_all_integrity).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    /// Backups first, then their host, then the pool.
    pub levels: Vec<IntegrityReport>,
    pub aborted: bool,
}

impl FsckReport {
    pub fn mismatch_count(&self) -> usize {
        self.levels.iter().map(|l| l.mismatches.len()).sum()
    }
}

/// Classification of on-disk chunks against the pool ledger and unused set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UnusedReport {
    /// On disk, in the unused set only.
    pub in_unused: u64,
    /// On disk, in the pool ledger only.
    pub in_refcnt: u64,
    /// On disk, in neither. Repair adds them to the unused set.
    pub in_nothing: u64,
    /// On disk, in both. Repair removes them from the unused set.
    pub in_both: u64,
    /// In the pool ledger but not on disk. Never repaired.
    pub missing: u64,
    /// In the unused set but not on disk. Repair drops them.
    pub stale_unused: u64,
    pub repaired: bool,
    pub aborted: bool,
}

impl UnusedReport {
    pub fn error_count(&self) -> u64 {
        self.in_nothing + self.in_both + self.missing
    }
}

/// Outcome of re-hashing every chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub ok: u64,
    pub corrupted: Vec<ChunkHash>,
    pub aborted: bool,
}

/// A point where cumulative on-disk size overtook cumulative content size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompressionAnomaly {
    pub sha256: ChunkHash,
    pub size: u64,
    pub compressed_size: u64,
    pub cumulative_size: u64,
    pub cumulative_compressed_size: u64,
    pub content_type: Option<&'static str>,
}

/// Pool-wide or ledger-wide compression totals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    pub chunks: u64,
    pub size: u64,
    pub compressed_size: u64,
    /// Chunks stored larger than their content.
    pub expanded_chunks: u64,
    pub anomalies: Vec<CompressionAnomaly>,
    pub aborted: bool,
}

impl CompressionReport {
    pub fn ratio(&self) -> Option<f64> {
        (self.size > 0).then(|| self.compressed_size as f64 / self.size as f64)
    }
}
