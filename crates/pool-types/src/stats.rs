use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate counters recomputed as a side effect of every fold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatistics {
    /// Sum of all positive reference counts.
    pub nb_ref: u64,
    /// Number of distinct chunks with a positive count.
    pub nb_chunk: u64,
    /// Highest single reference count seen.
    pub longest_chain: u64,
    /// Uncompressed bytes of referenced chunks.
    pub size: u64,
    /// On-disk bytes of referenced chunks.
    pub compressed_size: u64,
    /// On-disk bytes of chunks in the unused set.
    pub unused_size: u64,
}

impl PoolStatistics {
    /// Compression ratio of referenced chunks (compressed / uncompressed).
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.size == 0 {
            None
        } else {
            Some(self.compressed_size as f64 / self.size as f64)
        }
    }
}

/// Statistics stamped with the time of the fold that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsEntry {
    pub timestamp: DateTime<Utc>,
    pub statistics: PoolStatistics,
}

impl StatisticsEntry {
    pub fn new(timestamp: DateTime<Utc>, statistics: PoolStatistics) -> Self {
        Self {
            timestamp,
            statistics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_empty_pool_is_none() {
        assert!(PoolStatistics::default().compression_ratio().is_none());
    }

    #[test]
    fn ratio_is_compressed_over_size() {
        let stats = PoolStatistics {
            size: 200,
            compressed_size: 50,
            ..Default::default()
        };
        assert_eq!(stats.compression_ratio(), Some(0.25));
    }
}
