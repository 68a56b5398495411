use serde::{Deserialize, Serialize};

use crate::hash::ChunkHash;

/// One reference-count entry of a ledger.
///
/// A hash may appear several times in one ledger file; the authoritative
/// count is the sum of `ref_count` over every appearance once folded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefCountRecord {
    pub sha256: ChunkHash,
    pub ref_count: i64,
    /// Uncompressed length in bytes.
    pub size: u64,
    /// On-disk (compressed) length in bytes.
    pub compressed_size: u64,
}

impl RefCountRecord {
    pub fn new(sha256: ChunkHash, ref_count: i64, size: u64, compressed_size: u64) -> Self {
        Self {
            sha256,
            ref_count,
            size,
            compressed_size,
        }
    }

    /// The same record with its count negated. Folding a ledger together
    /// with its negation nets every count to zero.
    pub fn negated(self) -> Self {
        Self {
            ref_count: -self.ref_count,
            ..self
        }
    }

    /// The metadata of this record as an unused entry.
    pub fn to_unused(&self) -> UnusedRecord {
        UnusedRecord {
            sha256: self.sha256,
            size: self.size,
            compressed_size: self.compressed_size,
        }
    }
}

/// A chunk known to exist on disk with no positive reference count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnusedRecord {
    pub sha256: ChunkHash,
    pub size: u64,
    pub compressed_size: u64,
}

impl UnusedRecord {
    pub fn new(sha256: ChunkHash, size: u64, compressed_size: u64) -> Self {
        Self {
            sha256,
            size,
            compressed_size,
        }
    }
}

/// A record as it is framed inside a ledger file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerRecord {
    RefCount(RefCountRecord),
    Unused(UnusedRecord),
}

impl LedgerRecord {
    pub fn sha256(&self) -> ChunkHash {
        match self {
            Self::RefCount(r) => r.sha256,
            Self::Unused(u) => u.sha256,
        }
    }
}

impl From<RefCountRecord> for LedgerRecord {
    fn from(record: RefCountRecord) -> Self {
        Self::RefCount(record)
    }
}

impl From<UnusedRecord> for LedgerRecord {
    fn from(record: UnusedRecord) -> Self {
        Self::Unused(record)
    }
}

/// One chunk reference produced by the manifest layer.
///
/// A file referencing the same chunk twice yields two of these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub sha256: ChunkHash,
    /// Uncompressed size, 0 when the manifest does not record it.
    pub size: u64,
    /// Path of the file, inside the backup, that references the chunk.
    pub manifest_path: String,
}

impl ManifestChunk {
    pub fn new(sha256: ChunkHash, size: u64, manifest_path: impl Into<String>) -> Self {
        Self {
            sha256,
            size,
            manifest_path: manifest_path.into(),
        }
    }
}
