use std::collections::BTreeMap;

use pool_types::{ChunkHash, LedgerRecord, PoolStatistics, RefCountRecord};
use tracing::warn;

use crate::unused::UnusedSet;

/// Folded state of one hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCountEntry {
    pub ref_count: i64,
    pub size: u64,
    pub compressed_size: u64,
}

impl RefCountEntry {
    fn absorb_metadata(&mut self, sha256: &ChunkHash, size: u64, compressed_size: u64) {
        merge_metadata(&mut self.size, size, sha256, "size");
        merge_metadata(&mut self.compressed_size, compressed_size, sha256, "compressed_size");
    }
}

/// Authoritative per-hash counts, ordered by hash.
pub type RefCountMap = BTreeMap<ChunkHash, RefCountEntry>;

/// Output of [`calculate_ref_count`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FoldResult {
    /// Only hashes with a positive folded count.
    pub refcnt: RefCountMap,
    pub statistics: PoolStatistics,
}

impl FoldResult {
    /// The folded map as ledger records, one per hash.
    pub fn records(&self) -> impl Iterator<Item = RefCountRecord> + '_ {
        self.refcnt.iter().map(|(sha256, entry)| {
            RefCountRecord::new(*sha256, entry.ref_count, entry.size, entry.compressed_size)
        })
    }

    pub fn get(&self, sha256: &ChunkHash) -> Option<&RefCountEntry> {
        self.refcnt.get(sha256)
    }
}

/// Reduce a record stream into one authoritative count per hash.
///
/// Counts are summed per hash. Metadata keeps the first non-zero value seen;
/// later conflicting values are logged and ignored. An `Unused` record
/// contributes a count of zero and its metadata.
///
/// Hashes whose folded count is positive stay in the map and leave `unused`.
/// The rest are dropped from the map and, when an accumulator is given, moved
/// into it. Live maintenance and fsck both go through this function.
pub fn calculate_ref_count<I>(records: I, mut unused: Option<&mut UnusedSet>) -> FoldResult
where
    I: IntoIterator<Item = LedgerRecord>,
{
    let mut grouped = RefCountMap::new();
    for record in records {
        match record {
            LedgerRecord::RefCount(r) => {
                let entry = grouped.entry(r.sha256).or_default();
                entry.ref_count += r.ref_count;
                entry.absorb_metadata(&r.sha256, r.size, r.compressed_size);
            }
            LedgerRecord::Unused(u) => {
                grouped
                    .entry(u.sha256)
                    .or_default()
                    .absorb_metadata(&u.sha256, u.size, u.compressed_size);
            }
        }
    }

    let mut statistics = PoolStatistics::default();
    let mut refcnt = RefCountMap::new();
    for (sha256, entry) in grouped {
        if entry.ref_count > 0 {
            let count = entry.ref_count as u64;
            statistics.nb_ref += count;
            statistics.longest_chain = statistics.longest_chain.max(count);
            statistics.size += entry.size;
            statistics.compressed_size += entry.compressed_size;
            if let Some(unused) = unused.as_deref_mut() {
                unused.delete(&sha256);
            }
            refcnt.insert(sha256, entry);
        } else {
            if entry.ref_count < 0 {
                warn!(sha256 = %sha256, ref_count = entry.ref_count, "negative reference count after fold");
            }
            if let Some(unused) = unused.as_deref_mut() {
                let record = RefCountRecord::new(sha256, 0, entry.size, entry.compressed_size);
                unused.add(record.to_unused());
            }
        }
    }

    statistics.nb_chunk = refcnt.len() as u64;
    statistics.unused_size = unused.map(|u| u.compressed_size()).unwrap_or(0);

    FoldResult { refcnt, statistics }
}

fn merge_metadata(current: &mut u64, incoming: u64, sha256: &ChunkHash, field: &'static str) {
    if incoming == 0 {
        return;
    }
    if *current == 0 {
        *current = incoming;
    } else if *current != incoming {
        warn!(sha256 = %sha256, field, kept = *current, ignored = incoming, "conflicting chunk metadata");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_types::UnusedRecord;

    fn rc(seed: &[u8], count: i64) -> LedgerRecord {
        RefCountRecord::new(ChunkHash::of(seed), count, seed.len() as u64, 2).into()
    }

    #[test]
    fn sums_counts_per_hash() {
        let result = calculate_ref_count(vec![rc(b"a", 1), rc(b"b", 2), rc(b"a", 3)], None);
        assert_eq!(result.get(&ChunkHash::of(b"a")).unwrap().ref_count, 4);
        assert_eq!(result.get(&ChunkHash::of(b"b")).unwrap().ref_count, 2);
        assert_eq!(result.statistics.nb_ref, 6);
        assert_eq!(result.statistics.nb_chunk, 2);
        assert_eq!(result.statistics.longest_chain, 4);
    }

    #[test]
    fn zero_count_moves_to_unused() {
        let mut unused = UnusedSet::new();
        let result = calculate_ref_count(vec![rc(b"a", 2), rc(b"a", -2)], Some(&mut unused));
        assert!(result.refcnt.is_empty());
        assert!(unused.has(&ChunkHash::of(b"a")));
        assert_eq!(result.statistics.unused_size, 2);
    }

    #[test]
    fn negative_count_is_dropped_not_fatal() {
        let mut unused = UnusedSet::new();
        let result = calculate_ref_count(vec![rc(b"a", -1)], Some(&mut unused));
        assert!(result.refcnt.is_empty());
        assert!(unused.has(&ChunkHash::of(b"a")));
    }

    #[test]
    fn positive_count_leaves_unused() {
        let hash = ChunkHash::of(b"a");
        let mut unused = UnusedSet::from_records(vec![UnusedRecord::new(hash, 1, 2)]);
        let result = calculate_ref_count(vec![rc(b"a", 1)], Some(&mut unused));
        assert_eq!(result.statistics.nb_chunk, 1);
        assert!(!unused.has(&hash));
        assert_eq!(result.statistics.unused_size, 0);
    }

    #[test]
    fn first_non_zero_metadata_wins() {
        let hash = ChunkHash::of(b"meta");
        let records: Vec<LedgerRecord> = vec![
            RefCountRecord::new(hash, 1, 0, 0).into(),
            RefCountRecord::new(hash, 1, 10, 5).into(),
            RefCountRecord::new(hash, 1, 11, 6).into(),
        ];
        let result = calculate_ref_count(records, None);
        let entry = result.get(&hash).unwrap();
        assert_eq!((entry.ref_count, entry.size, entry.compressed_size), (3, 10, 5));
    }

    #[test]
    fn unused_record_contributes_metadata_only() {
        let hash = ChunkHash::of(b"u");
        let records: Vec<LedgerRecord> = vec![
            UnusedRecord::new(hash, 7, 4).into(),
            RefCountRecord::new(hash, 1, 0, 0).into(),
        ];
        let result = calculate_ref_count(records, None);
        let entry = result.get(&hash).unwrap();
        assert_eq!((entry.ref_count, entry.size, entry.compressed_size), (1, 7, 4));
    }

    #[test]
    fn statistics_accumulate_sizes_of_live_chunks() {
        let result = calculate_ref_count(vec![rc(b"aaaa", 1), rc(b"bb", 1), rc(b"c", 0)], None);
        assert_eq!(result.statistics.size, 6);
        assert_eq!(result.statistics.compressed_size, 4);
        assert_eq!(result.statistics.nb_chunk, 2);
    }

    #[test]
    fn records_are_one_per_hash() {
        let result = calculate_ref_count(vec![rc(b"a", 1), rc(b"a", 1)], None);
        let records: Vec<_> = result.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ref_count, 2);
    }
}
