use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::LedgerResult;

pub const POOL_REFCNT_FILE: &str = "REFCNT.pool.bin";
pub const UNUSED_FILE: &str = "UNUSED.pool.bin";
pub const HOST_REFCNT_FILE: &str = "REFCNT.host.bin";
pub const BACKUP_REFCNT_FILE: &str = "REFCNT.backup.bin";
pub const JOURNAL_FILE: &str = "REFCNT.journal.bin";
/// Suffix of a backup directory being removed.
pub const RETIRED_SUFFIX: &str = ".removing";

/// Ledger paths for one (host, backup, pool) triple. Pure derivation, no I/O.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceCount {
    pub pool_path: PathBuf,
    pub host_path: PathBuf,
    pub backup_path: PathBuf,
    pub unused_pool_path: PathBuf,
    /// Scratch ledger used while the backup ledger is rewritten.
    pub journal_path: PathBuf,
}

impl ReferenceCount {
    pub fn new(host_dir: &Path, backup_dir: &Path, pool_dir: &Path) -> Self {
        Self {
            pool_path: pool_dir.join(POOL_REFCNT_FILE),
            host_path: host_dir.join(HOST_REFCNT_FILE),
            backup_path: backup_dir.join(BACKUP_REFCNT_FILE),
            unused_pool_path: pool_dir.join(UNUSED_FILE),
            journal_path: backup_dir.join(JOURNAL_FILE),
        }
    }
}

/// Directory layout of a pool and the hosts backed up into it.
///
/// ```text
/// <pool_dir>/REFCNT.pool.bin
/// <pool_dir>/UNUSED.pool.bin
/// <hosts_dir>/<host>/REFCNT.host.bin
/// <hosts_dir>/<host>/<number>/REFCNT.backup.bin
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolLayout {
    pub pool_dir: PathBuf,
    pub hosts_dir: PathBuf,
}

impl PoolLayout {
    pub fn new(pool_dir: impl Into<PathBuf>, hosts_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool_dir: pool_dir.into(),
            hosts_dir: hosts_dir.into(),
        }
    }

    pub fn host_dir(&self, host: &str) -> PathBuf {
        self.hosts_dir.join(host)
    }

    pub fn backup_dir(&self, host: &str, number: u32) -> PathBuf {
        self.host_dir(host).join(number.to_string())
    }

    pub fn reference_count(&self, host: &str, number: u32) -> ReferenceCount {
        ReferenceCount::new(
            &self.host_dir(host),
            &self.backup_dir(host, number),
            &self.pool_dir,
        )
    }

    pub fn retired_backup_dir(&self, host: &str, number: u32) -> PathBuf {
        self.host_dir(host).join(format!("{number}{RETIRED_SUFFIX}"))
    }

    /// Rename a backup directory aside so it stops being listed by
    /// [`backups`](Self::backups). Returns the ledger paths of the renamed
    /// backup.
    ///
    /// A leftover directory from an interrupted removal of the same number is
    /// deleted first.
    pub fn retire_backup(&self, host: &str, number: u32) -> LedgerResult<ReferenceCount> {
        let retired = self.retired_backup_dir(host, number);
        remove_dir_if_present(&retired)?;
        fs::rename(self.backup_dir(host, number), &retired)?;
        Ok(ReferenceCount::new(&self.host_dir(host), &retired, &self.pool_dir))
    }

    pub fn purge_retired_backup(&self, host: &str, number: u32) -> LedgerResult<()> {
        remove_dir_if_present(&self.retired_backup_dir(host, number))?;
        Ok(())
    }

    pub fn pool_ledger_path(&self) -> PathBuf {
        self.pool_dir.join(POOL_REFCNT_FILE)
    }

    pub fn unused_path(&self) -> PathBuf {
        self.pool_dir.join(UNUSED_FILE)
    }

    pub fn host_ledger_path(&self, host: &str) -> PathBuf {
        self.host_dir(host).join(HOST_REFCNT_FILE)
    }

    /// Host directory names, sorted. A missing hosts directory has no hosts.
    pub fn hosts(&self) -> LedgerResult<Vec<String>> {
        let mut hosts = Vec::new();
        for entry in read_dir_or_empty(&self.hosts_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    hosts.push(name.to_string());
                }
            }
        }
        hosts.sort();
        Ok(hosts)
    }

    /// Backup numbers of a host, ascending. Non-numeric entries are ignored.
    pub fn backups(&self, host: &str) -> LedgerResult<Vec<u32>> {
        let mut numbers = Vec::new();
        for entry in read_dir_or_empty(&self.host_dir(host))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(number) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

/// Statistics history file kept next to a ledger.
pub fn statistics_path(ledger: &Path) -> PathBuf {
    ledger.with_extension("statistics.json")
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn read_dir_or_empty(dir: &Path) -> io::Result<Box<dyn Iterator<Item = io::Result<fs::DirEntry>>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Box::new(entries)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_count_derives_paths() {
        let rc = ReferenceCount::new(
            Path::new("/hosts/web"),
            Path::new("/hosts/web/3"),
            Path::new("/pool"),
        );
        assert_eq!(rc.pool_path, Path::new("/pool/REFCNT.pool.bin"));
        assert_eq!(rc.unused_pool_path, Path::new("/pool/UNUSED.pool.bin"));
        assert_eq!(rc.host_path, Path::new("/hosts/web/REFCNT.host.bin"));
        assert_eq!(rc.backup_path, Path::new("/hosts/web/3/REFCNT.backup.bin"));
        assert_eq!(rc.journal_path, Path::new("/hosts/web/3/REFCNT.journal.bin"));
    }

    #[test]
    fn layout_matches_reference_count() {
        let layout = PoolLayout::new("/pool", "/hosts");
        let rc = layout.reference_count("web", 3);
        assert_eq!(rc.pool_path, layout.pool_ledger_path());
        assert_eq!(rc.host_path, layout.host_ledger_path("web"));
        assert_eq!(rc.unused_pool_path, layout.unused_path());
    }

    #[test]
    fn statistics_path_sits_next_to_ledger() {
        assert_eq!(
            statistics_path(Path::new("/pool/REFCNT.pool.bin")),
            Path::new("/pool/REFCNT.pool.statistics.json")
        );
    }

    #[test]
    fn enumerates_hosts_and_numeric_backups() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PoolLayout::new(dir.path().join("pool"), dir.path().join("hosts"));
        assert!(layout.hosts().unwrap().is_empty());

        for sub in ["web/10", "web/2", "web/tmp", "db/1"] {
            fs::create_dir_all(layout.hosts_dir.join(sub)).unwrap();
        }
        fs::write(layout.host_ledger_path("web"), b"").unwrap();

        assert_eq!(layout.hosts().unwrap(), vec!["db", "web"]);
        assert_eq!(layout.backups("web").unwrap(), vec![2, 10]);
        assert!(layout.backups("missing").unwrap().is_empty());
    }

    #[test]
    fn retired_backup_leaves_the_listing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PoolLayout::new(dir.path().join("pool"), dir.path().join("hosts"));
        fs::create_dir_all(layout.backup_dir("web", 1)).unwrap();
        fs::create_dir_all(layout.backup_dir("web", 2)).unwrap();
        fs::write(layout.reference_count("web", 1).backup_path, b"ledger").unwrap();
        // Left over by an interrupted removal.
        fs::create_dir_all(layout.retired_backup_dir("web", 1)).unwrap();

        let paths = layout.retire_backup("web", 1).unwrap();
        assert_eq!(layout.backups("web").unwrap(), vec![2]);
        assert_eq!(fs::read(&paths.backup_path).unwrap(), b"ledger");
        assert_eq!(paths.host_path, layout.host_ledger_path("web"));

        layout.purge_retired_backup("web", 1).unwrap();
        assert!(!layout.retired_backup_dir("web", 1).exists());
        layout.purge_retired_backup("web", 1).unwrap();
    }
}
