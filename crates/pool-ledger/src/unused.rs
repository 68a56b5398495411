use std::collections::BTreeMap;

use pool_types::{ChunkHash, LedgerRecord, RefCountRecord, UnusedRecord};

/// Set of chunks known on disk with no positive reference count.
///
/// Keyed by hash only: `size` and `compressed_size` are metadata, not part of
/// the identity. Held in memory during a fold and persisted as an unused
/// ledger between operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnusedSet {
    records: BTreeMap<ChunkHash, UnusedRecord>,
}

impl UnusedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a record stream (typically an unused ledger).
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = UnusedRecord>,
    {
        records.into_iter().collect()
    }

    /// Build from reference-count records, keeping those matching `predicate`.
    pub fn from_ledger<I, P>(records: I, mut predicate: P) -> Self
    where
        I: IntoIterator<Item = RefCountRecord>,
        P: FnMut(&RefCountRecord) -> bool,
    {
        records
            .into_iter()
            .filter(|r| predicate(r))
            .map(|r| r.to_unused())
            .collect()
    }

    /// Insert or refresh a record. Returns `true` if the hash was not present.
    pub fn add(&mut self, record: UnusedRecord) -> bool {
        self.records.insert(record.sha256, record).is_none()
    }

    pub fn delete(&mut self, sha256: &ChunkHash) -> Option<UnusedRecord> {
        self.records.remove(sha256)
    }

    pub fn has(&self, sha256: &ChunkHash) -> bool {
        self.records.contains_key(sha256)
    }

    pub fn get(&self, sha256: &ChunkHash) -> Option<&UnusedRecord> {
        self.records.get(sha256)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of on-disk sizes, reported as `unused_size`.
    pub fn compressed_size(&self) -> u64 {
        self.records.values().map(|r| r.compressed_size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnusedRecord> {
        self.records.values()
    }

    /// Records in hash order, ready to be written as a ledger.
    pub fn to_ledger_records(&self) -> impl Iterator<Item = LedgerRecord> + '_ {
        self.records.values().copied().map(LedgerRecord::Unused)
    }
}

impl FromIterator<UnusedRecord> for UnusedSet {
    fn from_iter<T: IntoIterator<Item = UnusedRecord>>(iter: T) -> Self {
        let mut set = Self::new();
        for record in iter {
            set.add(record);
        }
        set
    }
}

impl IntoIterator for UnusedSet {
    type Item = UnusedRecord;
    type IntoIter = std::collections::btree_map::IntoValues<ChunkHash, UnusedRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused(seed: &[u8], compressed: u64) -> UnusedRecord {
        UnusedRecord::new(ChunkHash::of(seed), seed.len() as u64, compressed)
    }

    #[test]
    fn keyed_by_hash_only() {
        let mut set = UnusedSet::new();
        assert!(set.add(unused(b"a", 1)));
        assert!(!set.add(unused(b"a", 99)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&ChunkHash::of(b"a")).unwrap().compressed_size, 99);
    }

    #[test]
    fn add_delete_has() {
        let mut set = UnusedSet::new();
        set.add(unused(b"a", 1));
        assert!(set.has(&ChunkHash::of(b"a")));
        assert!(set.delete(&ChunkHash::of(b"a")).is_some());
        assert!(!set.has(&ChunkHash::of(b"a")));
        assert!(set.delete(&ChunkHash::of(b"a")).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn from_ledger_applies_predicate() {
        let records = vec![
            RefCountRecord::new(ChunkHash::of(b"live"), 2, 4, 4),
            RefCountRecord::new(ChunkHash::of(b"dead"), 0, 4, 3),
        ];
        let set = UnusedSet::from_ledger(records, |r| r.ref_count <= 0);
        assert_eq!(set.len(), 1);
        assert!(set.has(&ChunkHash::of(b"dead")));
    }

    #[test]
    fn compressed_size_sums_records() {
        let set = UnusedSet::from_records(vec![unused(b"a", 3), unused(b"b", 4)]);
        assert_eq!(set.compressed_size(), 7);
    }

    #[test]
    fn ledger_records_are_unused_variants() {
        let set = UnusedSet::from_records(vec![unused(b"a", 3)]);
        let records: Vec<_> = set.to_ledger_records().collect();
        assert!(matches!(records[..], [LedgerRecord::Unused(_)]));
    }
}
