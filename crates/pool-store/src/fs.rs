use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use pool_types::{ChunkHash, ChunkHasher};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::codec::{CountingWriter, VerifyingReader};
use crate::error::{StoreError, StoreResult};
use crate::handle::ChunkHandle;
use crate::layout::{chunk_relative_path, parse_chunk_file_name};
use crate::traits::{ChunkEntry, ChunkInfo, ChunkReader, ChunkStore};

/// Largest uncompressed chunk the chunker is expected to produce (4 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Staging directory for writes whose hash is not known in advance.
const STAGING_DIR: &str = "_new";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for the filesystem chunk store.
#[derive(Clone, Debug)]
pub struct ChunkStoreConfig {
    /// zlib compression level (0-9).
    pub compression_level: u32,
    /// Chunks above this uncompressed size are logged, not rejected.
    pub max_chunk_size: u64,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Chunk store on a local filesystem.
///
/// Temp files are created next to their final location (in the target shard
/// directory when the hash is announced, in a staging directory of the same
/// pool otherwise) so the final rename never crosses filesystems.
#[derive(Debug)]
pub struct FsChunkStore {
    root: PathBuf,
    config: ChunkStoreConfig,
}

impl FsChunkStore {
    /// Open (or create) a pool rooted at `root`.
    pub fn open(root: &Path, config: ChunkStoreConfig) -> StoreResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ChunkStoreConfig {
        &self.config
    }

    /// Absolute path of a chunk file.
    pub fn chunk_path(&self, sha256: &ChunkHash) -> PathBuf {
        self.root.join(chunk_relative_path(sha256))
    }

    /// Handle bound to one chunk of this store.
    pub fn get_chunk(&self, sha256: ChunkHash) -> ChunkHandle<'_> {
        ChunkHandle::new(self, sha256)
    }

    fn staging_dir(&self, expected: Option<&ChunkHash>) -> PathBuf {
        match expected.and_then(|h| self.chunk_path(h).parent().map(Path::to_path_buf)) {
            Some(shard) => shard,
            None => self.root.join(STAGING_DIR),
        }
    }

    fn open_chunk(&self, sha256: &ChunkHash) -> StoreResult<File> {
        File::open(self.chunk_path(sha256)).map_err(|e| not_found_or_io(sha256, e))
    }
}

impl ChunkStore for FsChunkStore {
    fn exists(&self, sha256: &ChunkHash) -> StoreResult<bool> {
        match fs::metadata(self.chunk_path(sha256)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, reader: &mut dyn Read, expected: Option<&ChunkHash>) -> StoreResult<ChunkInfo> {
        let staging = self.staging_dir(expected);
        fs::create_dir_all(&staging)?;
        let tmp = NamedTempFile::new_in(&staging)?;

        let mut encoder = ZlibEncoder::new(
            CountingWriter::new(BufWriter::new(tmp)),
            Compression::new(self.config.compression_level),
        );
        let mut hasher = ChunkHasher::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            encoder.write_all(&buf[..n])?;
        }

        let counting = encoder.finish()?;
        let mut compressed_size = counting.count();
        let tmp = counting.into_inner().into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;

        let size = hasher.len();
        let sha256 = hasher.finalize();

        if size > self.config.max_chunk_size {
            warn!(
                sha256 = %sha256,
                size,
                max = self.config.max_chunk_size,
                "chunk exceeds maximum chunk size"
            );
        }

        if let Some(expected) = expected {
            if *expected != sha256 {
                warn!(expected = %expected, computed = %sha256, "chunk content does not match announced hash");
                return Err(StoreError::HashMismatch {
                    expected: *expected,
                    computed: sha256,
                });
            }
        }

        let target = self.chunk_path(&sha256);
        if target.exists() {
            debug!(sha256 = %sha256, "chunk already stored");
            compressed_size = fs::metadata(&target)?.len();
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match tmp.persist_noclobber(&target) {
                Ok(_) => debug!(sha256 = %sha256, size, compressed_size, "chunk stored"),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(sha256 = %sha256, "chunk stored concurrently by another writer");
                    compressed_size = fs::metadata(&target)?.len();
                }
                Err(e) => return Err(e.error.into()),
            }
        }

        Ok(ChunkInfo {
            sha256,
            size,
            compressed_size,
        })
    }

    fn read(&self, sha256: &ChunkHash) -> StoreResult<ChunkReader> {
        let file = self.open_chunk(sha256)?;
        let decoder = ZlibDecoder::new(BufReader::new(file));
        Ok(Box::new(VerifyingReader::new(decoder, *sha256)))
    }

    fn remove(&self, sha256: &ChunkHash) -> StoreResult<()> {
        fs::remove_file(self.chunk_path(sha256)).map_err(|e| not_found_or_io(sha256, e))?;
        debug!(sha256 = %sha256, "chunk removed");
        Ok(())
    }

    fn archive(&self, sha256: &ChunkHash, archive_root: &Path) -> StoreResult<()> {
        let source = self.chunk_path(sha256);
        let target = archive_root.join(chunk_relative_path(sha256));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&source, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*sha256));
            }
            // Archive on another filesystem.
            Err(_) => {
                fs::copy(&source, &target).map_err(|e| not_found_or_io(sha256, e))?;
                fs::remove_file(&source)?;
            }
        }
        debug!(sha256 = %sha256, target = ?target, "chunk archived");
        Ok(())
    }

    fn compressed_size(&self, sha256: &ChunkHash) -> StoreResult<u64> {
        let meta = fs::metadata(self.chunk_path(sha256)).map_err(|e| not_found_or_io(sha256, e))?;
        Ok(meta.len())
    }

    fn list_all(&self) -> Box<dyn Iterator<Item = StoreResult<ChunkEntry>> + '_> {
        let walk = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(StoreError::Io(io::Error::from(e)))),
                };
                if !entry.file_type().is_file() {
                    return None;
                }
                let sha256 = parse_chunk_file_name(entry.file_name())?;
                let compressed_size = match entry.metadata() {
                    Ok(meta) => meta.len(),
                    Err(e) => return Some(Err(StoreError::Io(io::Error::from(e)))),
                };
                Some(Ok(ChunkEntry {
                    sha256,
                    path: entry.into_path(),
                    compressed_size,
                }))
            });
        Box::new(walk)
    }
}

fn not_found_or_io(sha256: &ChunkHash, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(*sha256)
    } else {
        StoreError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn open_store() -> (tempfile::TempDir, FsChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::open(dir.path(), ChunkStoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn concurrent_identical_writes_converge() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..64 * 1024u32).flat_map(|i| i.to_le_bytes()).collect();
        let data = Arc::new(data);
        let start = Arc::new(Barrier::new(8));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                // Separate handles on one directory, as separate processes would have.
                let store = FsChunkStore::open(dir.path(), ChunkStoreConfig::default()).unwrap();
                let data = Arc::clone(&data);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    store.write_bytes(&data).unwrap()
                })
            })
            .collect();
        let infos: Vec<ChunkInfo> = writers.into_iter().map(|w| w.join().unwrap()).collect();

        assert!(infos.iter().all(|info| *info == infos[0]));
        let store = FsChunkStore::open(dir.path(), ChunkStoreConfig::default()).unwrap();
        let listed: Vec<_> = store.list_all().collect::<StoreResult<_>>().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sha256, infos[0].sha256);
        assert_eq!(store.read_to_vec(&infos[0].sha256).unwrap(), *data);
    }

    #[test]
    fn write_places_file_at_sharded_path() {
        let (_dir, store) = open_store();
        let info = store.write_bytes(b"hello").unwrap();
        let path = store.chunk_path(&info.sha256);
        assert!(path.is_file());
        assert_eq!(fs::metadata(&path).unwrap().len(), info.compressed_size);
        assert!(path.to_string_lossy().ends_with("-sha256.zz"));
    }

    #[test]
    fn exists_is_false_for_unknown_chunk() {
        let (_dir, store) = open_store();
        assert!(!store.exists(&ChunkHash::of(b"never written")).unwrap());
    }

    #[test]
    fn write_with_matching_expected_hash() {
        let (_dir, store) = open_store();
        let hash = ChunkHash::of(b"expected");
        let mut reader = &b"expected"[..];
        let info = store.write(&mut reader, Some(&hash)).unwrap();
        assert_eq!(info.sha256, hash);
        assert!(store.exists(&hash).unwrap());
    }

    #[test]
    fn write_with_wrong_expected_hash_stores_nothing() {
        let (_dir, store) = open_store();
        let announced = ChunkHash::of(b"announced");
        let mut reader = &b"actual"[..];
        let err = store.write(&mut reader, Some(&announced)).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(!store.exists(&ChunkHash::of(b"actual")).unwrap());
        assert!(!store.exists(&announced).unwrap());
        assert_eq!(store.list_all().count(), 0);
    }

    #[test]
    fn oversize_chunk_is_stored_anyway() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChunkStoreConfig {
            max_chunk_size: 4,
            ..Default::default()
        };
        let store = FsChunkStore::open(dir.path(), config).unwrap();
        let info = store.write_bytes(b"larger than four").unwrap();
        assert!(store.exists(&info.sha256).unwrap());
    }

    #[test]
    fn read_missing_chunk_is_not_found() {
        let (_dir, store) = open_store();
        let err = store.read(&ChunkHash::of(b"missing")).err().unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn read_detects_renamed_chunk() {
        let (_dir, store) = open_store();
        let info = store.write_bytes(b"original").unwrap();
        let impostor = ChunkHash::of(b"impostor");
        let target = store.chunk_path(&impostor);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::copy(store.chunk_path(&info.sha256), &target).unwrap();

        assert!(matches!(
            store.read_to_vec(&impostor),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(!store.verify(&impostor).unwrap());
        assert!(store.verify(&info.sha256).unwrap());
    }

    #[test]
    fn read_detects_garbage_file() {
        let (_dir, store) = open_store();
        let hash = ChunkHash::of(b"garbage");
        let target = store.chunk_path(&hash);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"not a zlib stream").unwrap();
        assert!(!store.verify(&hash).unwrap());
    }

    #[test]
    fn remove_deletes_file() {
        let (_dir, store) = open_store();
        let info = store.write_bytes(b"to remove").unwrap();
        store.remove(&info.sha256).unwrap();
        assert!(!store.exists(&info.sha256).unwrap());
        assert!(matches!(
            store.remove(&info.sha256),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn archive_moves_file_keeping_layout() {
        let (_dir, store) = open_store();
        let archive = tempfile::tempdir().unwrap();
        let info = store.write_bytes(b"archived").unwrap();
        store.archive(&info.sha256, archive.path()).unwrap();
        assert!(!store.exists(&info.sha256).unwrap());
        assert!(archive
            .path()
            .join(chunk_relative_path(&info.sha256))
            .is_file());
    }

    #[test]
    fn list_all_skips_non_chunk_files() {
        let (dir, store) = open_store();
        let a = store.write_bytes(b"a").unwrap();
        let b = store.write_bytes(b"b").unwrap();
        fs::write(dir.path().join("REFCNT.pool.bin"), b"ledger").unwrap();

        let mut found: Vec<ChunkHash> = store
            .list_all()
            .map(|entry| entry.unwrap().sha256)
            .collect();
        found.sort();
        let mut expected = vec![a.sha256, b.sha256];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn info_reports_both_sizes() {
        let (_dir, store) = open_store();
        let data = vec![7u8; 10_000];
        let written = store.write_bytes(&data).unwrap();
        let info = store.info(&written.sha256).unwrap();
        assert_eq!(info, written);
        assert!(info.compressed_size < info.size);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn write_then_read_reproduces_bytes(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let (_dir, store) = open_store();
            let info = store.write_bytes(&data).unwrap();
            prop_assert_eq!(info.sha256, ChunkHash::of(&data));
            prop_assert_eq!(store.read_to_vec(&info.sha256).unwrap(), data);
        }
    }
}
