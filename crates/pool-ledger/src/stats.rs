use std::fs;
use std::path::Path;

use pool_types::StatisticsEntry;
use tracing::{debug, warn};

use crate::codec::replace_file;
use crate::error::{LedgerError, LedgerResult};
use crate::paths::statistics_path;

/// Entries kept in a history file; older ones are dropped first.
pub const MAX_HISTORY: usize = 4096;

/// Statistics history of a ledger, oldest first.
///
/// A missing or unreadable history file reads as empty.
pub fn read_statistics(ledger: &Path) -> Vec<StatisticsEntry> {
    let path = statistics_path(ledger);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = ?path, error = %e, "cannot read statistics history");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&data) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = ?path, error = %e, "corrupt statistics history, starting over");
            Vec::new()
        }
    }
}

/// Most recent statistics of a ledger, if any were recorded.
pub fn latest_statistics(ledger: &Path) -> Option<StatisticsEntry> {
    read_statistics(ledger).pop()
}

/// Append `entry` to the history of `ledger`.
///
/// An entry with the same timestamp is replaced, so re-running a fold for the
/// same point in time does not duplicate it.
pub fn record_statistics(ledger: &Path, entry: StatisticsEntry) -> LedgerResult<()> {
    let mut history = read_statistics(ledger);
    history.retain(|e| e.timestamp != entry.timestamp);
    history.push(entry);
    history.sort_by_key(|e| e.timestamp);
    if history.len() > MAX_HISTORY {
        let excess = history.len() - MAX_HISTORY;
        history.drain(..excess);
    }

    let path = statistics_path(ledger);
    replace_file(&path, |w| {
        serde_json::to_writer_pretty(w, &history)
            .map_err(|e| LedgerError::Serialization(e.to_string()))
    })?;
    debug!(path = ?path, entries = history.len(), "statistics recorded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use pool_types::PoolStatistics;

    fn entry(minutes: i64, nb_chunk: u64) -> StatisticsEntry {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        StatisticsEntry::new(
            base + Duration::minutes(minutes),
            PoolStatistics {
                nb_chunk,
                ..Default::default()
            },
        )
    }

    #[test]
    fn missing_history_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("REFCNT.pool.bin");
        assert!(read_statistics(&ledger).is_empty());
        assert!(latest_statistics(&ledger).is_none());
    }

    #[test]
    fn history_is_sorted_and_latest_is_last() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("REFCNT.pool.bin");
        record_statistics(&ledger, entry(10, 2)).unwrap();
        record_statistics(&ledger, entry(5, 1)).unwrap();

        let history = read_statistics(&ledger);
        assert_eq!(history, vec![entry(5, 1), entry(10, 2)]);
        assert_eq!(latest_statistics(&ledger), Some(entry(10, 2)));
    }

    #[test]
    fn same_timestamp_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("REFCNT.pool.bin");
        record_statistics(&ledger, entry(1, 1)).unwrap();
        record_statistics(&ledger, entry(1, 9)).unwrap();
        assert_eq!(read_statistics(&ledger), vec![entry(1, 9)]);
    }

    #[test]
    fn corrupt_history_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("REFCNT.pool.bin");
        fs::write(statistics_path(&ledger), b"{not json").unwrap();
        assert!(read_statistics(&ledger).is_empty());
        record_statistics(&ledger, entry(0, 3)).unwrap();
        assert_eq!(read_statistics(&ledger).len(), 1);
    }
}
