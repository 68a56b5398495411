use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use pool_ledger::PoolLayout;
use pool_types::{ChunkHash, ManifestChunk};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsckError, FsckResult};

/// Lazy stream of the chunk references of one backup.
pub type ManifestChunks<'a> = Box<dyn Iterator<Item = FsckResult<ManifestChunk>> + 'a>;

/// The manifest layer, as seen by fsck.
///
/// Enumerates hosts and backups and, for one backup, every chunk reference of
/// every file. A chunk referenced twice is listed twice.
pub trait BackupCatalog: Send + Sync {
    fn hosts(&self) -> FsckResult<Vec<String>>;

    fn backups(&self, host: &str) -> FsckResult<Vec<u32>>;

    fn list_chunks(&self, host: &str, number: u32) -> FsckResult<ManifestChunks<'_>>;
}

/// One line of a manifest export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLine {
    pub path: String,
    /// Hex SHA-256 of each chunk, in file order.
    pub chunks: Vec<String>,
    /// Uncompressed size of each chunk; may be omitted.
    #[serde(default)]
    pub sizes: Vec<u64>,
}

/// Catalog reading manifest exports: `<backup>/manifests/*.jsonl`, one
/// [`ManifestLine`] per line. Hosts and backups come from the directory layout.
#[derive(Clone, Debug)]
pub struct JsonlCatalog {
    layout: PoolLayout,
}

impl JsonlCatalog {
    pub const MANIFEST_DIR: &'static str = "manifests";

    pub fn new(layout: PoolLayout) -> Self {
        Self { layout }
    }

    pub fn manifest_dir(&self, host: &str, number: u32) -> PathBuf {
        self.layout.backup_dir(host, number).join(Self::MANIFEST_DIR)
    }

    fn manifest_files(&self, host: &str, number: u32) -> FsckResult<Vec<PathBuf>> {
        let dir = self.manifest_dir(host, number);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl BackupCatalog for JsonlCatalog {
    fn hosts(&self) -> FsckResult<Vec<String>> {
        Ok(self.layout.hosts()?)
    }

    fn backups(&self, host: &str) -> FsckResult<Vec<u32>> {
        Ok(self.layout.backups(host)?)
    }

    fn list_chunks(&self, host: &str, number: u32) -> FsckResult<ManifestChunks<'_>> {
        let files = self.manifest_files(host, number)?;
        debug!(host, number, files = files.len(), "reading manifest export");
        Ok(Box::new(
            files.into_iter().flat_map(|path| -> ManifestChunks<'static> {
                match File::open(&path) {
                    Ok(file) => read_manifest(path, BufReader::new(file)),
                    Err(e) => Box::new(std::iter::once(Err(e.into()))),
                }
            }),
        ))
    }
}

fn read_manifest(path: PathBuf, reader: impl BufRead + 'static) -> ManifestChunks<'static> {
    Box::new(
        reader
            .lines()
            .enumerate()
            .filter(|(_, line)| !matches!(line, Ok(l) if l.trim().is_empty()))
            .flat_map(move |(index, line)| match parse_line(&path, index + 1, line) {
                Ok(chunks) => chunks.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            }),
    )
}

fn parse_line(path: &Path, line_no: usize, line: io::Result<String>) -> FsckResult<Vec<ManifestChunk>> {
    let line = line?;
    let entry: ManifestLine = serde_json::from_str(&line)
        .map_err(|e| FsckError::Catalog(format!("{}:{line_no}: {e}", path.display())))?;
    entry
        .chunks
        .iter()
        .enumerate()
        .map(|(i, hex)| -> FsckResult<ManifestChunk> {
            let sha256 = hex.parse::<ChunkHash>().map_err(|e| {
                FsckError::Catalog(format!("{}:{line_no}: {e}", path.display()))
            })?;
            let size = entry.sizes.get(i).copied().unwrap_or(0);
            Ok(ManifestChunk::new(sha256, size, entry.path.clone()))
        })
        .collect()
}

/// Catalog held in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    backups: RwLock<BTreeMap<(String, u32), Vec<ManifestChunk>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the chunk references of a backup.
    pub fn insert(&self, host: &str, number: u32, chunks: Vec<ManifestChunk>) -> FsckResult<()> {
        self.backups
            .write()
            .map_err(|e| FsckError::Catalog(format!("lock poisoned: {e}")))?
            .insert((host.to_string(), number), chunks);
        Ok(())
    }

    fn snapshot(&self) -> FsckResult<BTreeMap<(String, u32), Vec<ManifestChunk>>> {
        Ok(self
            .backups
            .read()
            .map_err(|e| FsckError::Catalog(format!("lock poisoned: {e}")))?
            .clone())
    }
}

impl BackupCatalog for InMemoryCatalog {
    fn hosts(&self) -> FsckResult<Vec<String>> {
        let mut hosts: Vec<_> = self.snapshot()?.into_keys().map(|(host, _)| host).collect();
        hosts.dedup();
        Ok(hosts)
    }

    fn backups(&self, host: &str) -> FsckResult<Vec<u32>> {
        Ok(self
            .snapshot()?
            .into_keys()
            .filter(|(h, _)| h == host)
            .map(|(_, number)| number)
            .collect())
    }

    fn list_chunks(&self, host: &str, number: u32) -> FsckResult<ManifestChunks<'_>> {
        let chunks = self
            .snapshot()?
            .remove(&(host.to_string(), number))
            .unwrap_or_default();
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }
}
