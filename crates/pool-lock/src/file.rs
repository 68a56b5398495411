use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LockError, LockResult};
use crate::signal::AbortSignal;
use crate::traits::{LockLease, LockService};

const LOCK_SUFFIX: &str = ".lock";
const GUARD_SUFFIX: &str = ".break";
/// Break guards are held for a few file operations at most.
const GUARD_STALE: Duration = Duration::from_secs(10);
const GUARD_POLL: Duration = Duration::from_millis(5);
/// Default lease lifetime: 10 minutes.
pub const DEFAULT_LEASE_SECS: u64 = 10 * 60;

/// Tuning for [`FileLockService`].
#[derive(Clone, Debug)]
pub struct FileLockConfig {
    /// How long a lease stays valid. Locks older than this are broken.
    pub lease: Duration,
    /// Base delay between acquisition attempts; jittered by +/-25%.
    pub retry_delay: Duration,
}

impl Default for FileLockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(DEFAULT_LEASE_SECS),
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Contents of one lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    owner: Uuid,
    resource: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
enum Staleness {
    Live,
    Expired(Uuid),
    Unreadable,
}

/// Advisory lock stored as one file per resource in `locks/`.
///
/// Lock files are written aside and linked into place without clobbering, so
/// at most one process wins a given resource and a lock file is never seen
/// half-written. Lease-expired files are removed by the next contender.
#[derive(Debug)]
pub struct FileLockService {
    dir: PathBuf,
    config: FileLockConfig,
}

impl FileLockService {
    pub fn new(dir: impl Into<PathBuf>, config: FileLockConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    /// Locks kept under `<pool_dir>/locks`.
    pub fn for_pool(pool_dir: &Path, config: FileLockConfig) -> Self {
        Self::new(pool_dir.join("locks"), config)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{}{LOCK_SUFFIX}", sanitize(resource)))
    }

    /// One attempt at taking every resource. On contention, releases what it
    /// took and returns `Ok(false)`.
    fn try_acquire_all(&self, owner: Uuid, resources: &[String]) -> LockResult<bool> {
        let mut taken: Vec<&str> = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.try_acquire_one(owner, resource) {
                Ok(true) => taken.push(resource),
                Ok(false) => {
                    for held in taken {
                        self.remove_owned(owner, held)?;
                    }
                    return Ok(false);
                }
                Err(e) => {
                    for held in taken {
                        let _ = self.remove_owned(owner, held);
                    }
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    fn try_acquire_one(&self, owner: Uuid, resource: &str) -> LockResult<bool> {
        let path = self.lock_path(resource);
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_LEASE_SECS as i64));
        let entry = LockEntry {
            owner,
            resource: resource.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + lease,
        };
        let data = serde_json::to_vec_pretty(&entry)
            .map_err(|e| LockError::Serialization(e.to_string()))?;

        // The entry is complete before the lock file appears under its name.
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                if self.break_if_stale(&path)? {
                    // Retry immediately; another contender may still win.
                    return self.try_acquire_one(owner, resource);
                }
                Ok(false)
            }
            Err(e) => Err(e.error.into()),
        }
    }

    /// Whether the lock file at `path` can be broken. `None` if it is gone.
    ///
    /// Unparseable files only become stale once their mtime is older than
    /// the lease.
    fn stale_owner(&self, path: &Path) -> LockResult<Option<Staleness>> {
        match read_entry(path)? {
            None => Ok(None),
            Some(Some(entry)) if entry.expires_at <= Utc::now() => {
                Ok(Some(Staleness::Expired(entry.owner)))
            }
            Some(Some(_)) => Ok(Some(Staleness::Live)),
            Some(None) => match file_age(path)? {
                None => Ok(None),
                Some(age) if age >= self.config.lease => Ok(Some(Staleness::Unreadable)),
                Some(_) => Ok(Some(Staleness::Live)),
            },
        }
    }

    /// Remove `path` if its lease has expired.
    ///
    /// Runs under the break guard and re-reads the file there, so a lock
    /// created after the staleness check is never removed.
    fn break_if_stale(&self, path: &Path) -> LockResult<bool> {
        let observed = match self.stale_owner(path)? {
            None => return Ok(true),
            Some(Staleness::Live) => return Ok(false),
            Some(stale) => stale,
        };
        let broken = self.guarded(path, || {
            let current = self.stale_owner(path)?;
            if current.as_ref() != Some(&observed) {
                return Ok(current.is_none());
            }
            warn!(path = ?path, "breaking stale lock");
            remove_if_present(path)?;
            Ok(true)
        })?;
        Ok(broken.unwrap_or(false))
    }

    fn remove_owned(&self, owner: Uuid, resource: &str) -> LockResult<()> {
        let path = self.lock_path(resource);
        loop {
            let done = self.guarded(&path, || match read_entry(&path)? {
                Some(Some(entry)) if entry.owner == owner => remove_if_present(&path),
                Some(_) => {
                    warn!(path = ?path, "lock no longer owned by this lease, leaving it");
                    Ok(())
                }
                None => Ok(()),
            })?;
            if done.is_some() {
                return Ok(());
            }
            std::thread::sleep(self.config.retry_delay.min(GUARD_POLL));
        }
    }

    /// Run `f` holding the break guard of `path`. `None` if another process
    /// holds the guard.
    ///
    /// Every removal of a lock file happens under this guard; creation never
    /// overwrites. A guard older than [`GUARD_STALE`] was left by a crashed
    /// process and is cleared.
    fn guarded<T>(&self, path: &Path, f: impl FnOnce() -> LockResult<T>) -> LockResult<Option<T>> {
        let guard = guard_path(path);
        match OpenOptions::new().write(true).create_new(true).open(&guard) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if file_age(&guard)?.is_some_and(|age| age >= GUARD_STALE) {
                    warn!(path = ?guard, "clearing abandoned lock guard");
                    remove_if_present(&guard)?;
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let outcome = f();
        remove_if_present(&guard)?;
        outcome.map(Some)
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.config.retry_delay.as_millis().max(4) as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base - base / 4 + jitter)
    }
}

impl LockService for FileLockService {
    fn acquire(&self, resources: &[String], timeout: Duration) -> LockResult<LockLease> {
        fs::create_dir_all(&self.dir)?;

        // Fixed order avoids deadlock between overlapping resource sets.
        let mut ordered = resources.to_vec();
        ordered.sort();
        ordered.dedup();

        let started = Instant::now();
        let mut lease = LockLease::new(ordered, AbortSignal::with_lease(self.config.lease));
        loop {
            if self.try_acquire_all(lease.id, &lease.resources)? {
                // Restart the lease clock from the moment every file exists.
                lease.signal = AbortSignal::with_lease(self.config.lease);
                debug!(owner = %lease.id, resources = ?lease.resources, "lock acquired");
                return Ok(lease);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    resources: lease.resources,
                    waited,
                });
            }
            let delay = self.jittered_delay().min(timeout - waited);
            debug!(resources = ?lease.resources, delay_ms = delay.as_millis() as u64, "lock contention, retrying");
            std::thread::sleep(delay);
        }
    }

    fn release(&self, lease: LockLease) -> LockResult<()> {
        for resource in &lease.resources {
            self.remove_owned(lease.id, resource)?;
        }
        debug!(owner = %lease.id, "lock released");
        Ok(())
    }

    fn is_locked(&self, resources: &[String]) -> LockResult<bool> {
        for resource in resources {
            if self.stale_owner(&self.lock_path(resource))? == Some(Staleness::Live) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `None` if the file does not exist, `Some(None)` if it is unparseable.
fn read_entry(path: &Path) -> LockResult<Option<Option<LockEntry>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data).ok())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn file_age(path: &Path) -> LockResult<Option<Duration>> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified()?;
            Ok(Some(SystemTime::now().duration_since(modified).unwrap_or_default()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> LockResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn guard_path(lock: &Path) -> PathBuf {
    let mut name = lock.as_os_str().to_owned();
    name.push(GUARD_SUFFIX);
    PathBuf::from(name)
}

/// Map a resource name to a file name: `[A-Za-z0-9.-]` kept, every other byte
/// escaped as `_xx`.
fn sanitize(resource: &str) -> String {
    let mut out = String::with_capacity(resource.len());
    for byte in resource.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}
