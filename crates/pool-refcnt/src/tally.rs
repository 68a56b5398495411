use std::collections::BTreeMap;

use pool_ledger::{calculate_ref_count, FoldResult};
use pool_store::{ChunkStore, StoreError};
use pool_types::{ChunkHash, LedgerRecord, ManifestChunk, RefCountRecord};
use tracing::warn;

/// Reference counts of one backup, recomputed from its manifests.
#[derive(Clone, Debug, Default)]
pub struct ManifestTally {
    pub fold: FoldResult,
    /// Files referencing each chunk, in manifest order.
    pub filenames: BTreeMap<ChunkHash, Vec<String>>,
}

impl ManifestTally {
    pub fn filenames(&self, sha256: &ChunkHash) -> &[String] {
        self.filenames.get(sha256).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Count every manifest reference once.
///
/// The on-disk size of each distinct chunk is looked up in `store`, and so is
/// its content size when the manifest does not carry one. A chunk the store
/// does not have is counted with a compressed size of 0.
pub fn tally_manifest_chunks<I>(chunks: I, store: &dyn ChunkStore) -> ManifestTally
where
    I: IntoIterator<Item = ManifestChunk>,
{
    let mut filenames: BTreeMap<ChunkHash, Vec<String>> = BTreeMap::new();
    let mut sizes: BTreeMap<ChunkHash, (u64, u64)> = BTreeMap::new();
    let mut records = Vec::new();

    for chunk in chunks {
        let (size, compressed_size) = *sizes
            .entry(chunk.sha256)
            .or_insert_with(|| chunk_sizes(&chunk, store));
        records.push(LedgerRecord::from(RefCountRecord::new(
            chunk.sha256,
            1,
            size,
            compressed_size,
        )));
        filenames
            .entry(chunk.sha256)
            .or_default()
            .push(chunk.manifest_path);
    }

    ManifestTally {
        fold: calculate_ref_count(records, None),
        filenames,
    }
}

/// Content and on-disk size of a referenced chunk.
fn chunk_sizes(chunk: &ManifestChunk, store: &dyn ChunkStore) -> (u64, u64) {
    let measured = if chunk.size == 0 {
        store.info(&chunk.sha256).map(|info| (info.size, info.compressed_size))
    } else {
        store
            .compressed_size(&chunk.sha256)
            .map(|compressed| (chunk.size, compressed))
    };
    match measured {
        Ok(sizes) => sizes,
        Err(StoreError::NotFound(_)) => {
            warn!(sha256 = %chunk.sha256, path = %chunk.manifest_path, "manifest references a missing chunk");
            (chunk.size, 0)
        }
        Err(e) => {
            warn!(sha256 = %chunk.sha256, error = %e, "cannot stat chunk");
            (chunk.size, 0)
        }
    }
}
