use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pool_lock::{FileLockConfig, DEFAULT_LEASE_SECS};
use pool_store::{ChunkStoreConfig, DEFAULT_MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

/// Settings read from `pool.toml`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_dir: PathBuf,
    pub hosts_dir: PathBuf,
    pub lock_timeout_secs: u64,
    pub compression_level: u32,
    pub max_chunk_size: u64,
    /// Lease lifetime; older lock files are treated as stale.
    pub lock_stale_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_dir: PathBuf::from("pool"),
            hosts_dir: PathBuf::from("hosts"),
            lock_timeout_secs: 30,
            compression_level: 6,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            lock_stale_secs: DEFAULT_LEASE_SECS,
        }
    }
}

impl PoolConfig {
    pub const FILE_NAME: &'static str = "pool.toml";

    /// Read `path`, or `pool.toml` in the working directory. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or(Path::new(Self::FILE_NAME));
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("invalid config {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read config {}", path.display())),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn store_config(&self) -> ChunkStoreConfig {
        ChunkStoreConfig {
            compression_level: self.compression_level.min(9),
            max_chunk_size: self.max_chunk_size,
        }
    }

    pub fn lock_config(&self) -> FileLockConfig {
        FileLockConfig {
            lease: Duration::from_secs(self.lock_stale_secs),
            ..FileLockConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = PoolConfig::default();
        assert_eq!(c.pool_dir, PathBuf::from("pool"));
        assert_eq!(c.lock_timeout(), Duration::from_secs(30));
        assert_eq!(c.compression_level, 6);
        assert_eq!(c.max_chunk_size, 4 * 1024 * 1024);
        assert_eq!(c.lock_config().lease, Duration::from_secs(DEFAULT_LEASE_SECS));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = PoolConfig::parse("pool_dir = \"/srv/pool\"\ncompression_level = 12\n").unwrap();
        assert_eq!(c.pool_dir, PathBuf::from("/srv/pool"));
        assert_eq!(c.hosts_dir, PathBuf::from("hosts"));
        assert_eq!(c.store_config().compression_level, 9);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let c = PoolConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(c, PoolConfig::default());
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(PoolConfig::parse("lock_timeout_secs = \"soon\"").is_err());
    }
}
