use std::io::Read;

use pool_types::ChunkHash;

use crate::error::StoreResult;
use crate::traits::{ChunkInfo, ChunkReader, ChunkStore};

/// Read/write handle on one chunk of a store.
///
/// Writes through the handle announce the handle's hash, so content that does
/// not match is refused.
pub struct ChunkHandle<'a> {
    store: &'a dyn ChunkStore,
    sha256: ChunkHash,
}

impl<'a> ChunkHandle<'a> {
    pub fn new(store: &'a dyn ChunkStore, sha256: ChunkHash) -> Self {
        Self { store, sha256 }
    }

    pub fn sha256(&self) -> &ChunkHash {
        &self.sha256
    }

    pub fn exists(&self) -> StoreResult<bool> {
        self.store.exists(&self.sha256)
    }

    pub fn read(&self) -> StoreResult<ChunkReader> {
        self.store.read(&self.sha256)
    }

    pub fn read_to_vec(&self) -> StoreResult<Vec<u8>> {
        self.store.read_to_vec(&self.sha256)
    }

    pub fn write(&self, reader: &mut dyn Read) -> StoreResult<ChunkInfo> {
        self.store.write(reader, Some(&self.sha256))
    }

    pub fn remove(&self) -> StoreResult<()> {
        self.store.remove(&self.sha256)
    }
}

impl std::fmt::Debug for ChunkHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("sha256", &self.sha256)
            .finish()
    }
}
