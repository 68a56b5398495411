use std::io::{self, Read};
use std::path::{Path, PathBuf};

use pool_types::ChunkHash;

use crate::error::{StoreError, StoreResult};

/// Decompressed, hash-verifying content stream of one chunk.
pub type ChunkReader = Box<dyn Read + Send>;

/// Result of writing a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub sha256: ChunkHash,
    /// Uncompressed length.
    pub size: u64,
    /// On-disk length.
    pub compressed_size: u64,
}

/// A chunk file found while walking the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkEntry {
    pub sha256: ChunkHash,
    pub path: PathBuf,
    pub compressed_size: u64,
}

/// Content-addressed chunk store.
///
/// All implementations must satisfy these invariants:
/// - The name of a stored chunk is the SHA-256 of its uncompressed bytes,
///   computed from the bytes actually written.
/// - A chunk becomes visible atomically; readers never see a partial file.
/// - Writing content that already exists is a successful no-op.
/// - Reads verify content against the name; any error on the returned stream
///   means the chunk is corrupt.
/// - `remove` and `archive` are not safe against concurrent removal; callers
///   hold the pool-wide lock.
pub trait ChunkStore: Send + Sync {
    /// Whether a chunk file exists for this hash.
    fn exists(&self, sha256: &ChunkHash) -> StoreResult<bool>;

    /// Stream `reader` into the pool.
    ///
    /// When `expected` is given and the computed hash differs, nothing is
    /// stored and [`StoreError::HashMismatch`] is returned.
    fn write(&self, reader: &mut dyn Read, expected: Option<&ChunkHash>) -> StoreResult<ChunkInfo>;

    /// Open a decompressing, verifying stream over a chunk.
    fn read(&self, sha256: &ChunkHash) -> StoreResult<ChunkReader>;

    /// Delete a chunk file.
    fn remove(&self, sha256: &ChunkHash) -> StoreResult<()>;

    /// Move a chunk file under `archive_root`, keeping the shard layout.
    fn archive(&self, sha256: &ChunkHash, archive_root: &Path) -> StoreResult<()>;

    /// On-disk size of a chunk.
    fn compressed_size(&self, sha256: &ChunkHash) -> StoreResult<u64>;

    /// Lazily walk every chunk file of the pool.
    ///
    /// The walk is finite and restartable by calling again.
    fn list_all(&self) -> Box<dyn Iterator<Item = StoreResult<ChunkEntry>> + '_>;

    /// Write a complete buffer.
    fn write_bytes(&self, data: &[u8]) -> StoreResult<ChunkInfo> {
        let mut reader = data;
        self.write(&mut reader, None)
    }

    /// Read and verify a whole chunk into memory.
    fn read_to_vec(&self, sha256: &ChunkHash) -> StoreResult<Vec<u8>> {
        let mut reader = self.read(sha256)?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .map_err(|e| corrupt(sha256, e))?;
        Ok(out)
    }

    /// Size metadata of a stored chunk. Decompresses the chunk to count its
    /// uncompressed length.
    fn info(&self, sha256: &ChunkHash) -> StoreResult<ChunkInfo> {
        let compressed_size = self.compressed_size(sha256)?;
        let mut reader = self.read(sha256)?;
        let size = io::copy(&mut reader, &mut io::sink()).map_err(|e| corrupt(sha256, e))?;
        Ok(ChunkInfo {
            sha256: *sha256,
            size,
            compressed_size,
        })
    }

    /// Decompress and re-hash a chunk.
    ///
    /// `Ok(false)` means the chunk exists but is corrupt; a missing chunk is
    /// an error.
    fn verify(&self, sha256: &ChunkHash) -> StoreResult<bool> {
        let mut reader = self.read(sha256)?;
        match io::copy(&mut reader, &mut io::sink()) {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::debug!(sha256 = %sha256, error = %e, "chunk failed verification");
                Ok(false)
            }
        }
    }
}

fn corrupt(sha256: &ChunkHash, e: io::Error) -> StoreError {
    StoreError::Corrupt {
        sha256: *sha256,
        reason: e.to_string(),
    }
}
