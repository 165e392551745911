//! Cache statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::pool::Cache;

/// Snapshot of pool occupancy and activity counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    /// Number of slots in the pool
    pub slot_count: usize,
    /// Slots currently bound to a piece
    pub occupied_slots: usize,
    /// Bytes written into currently occupied slots
    pub filled_bytes: u64,
    /// Total bytes reserved by the pool
    pub capacity_bytes: u64,
    /// Pieces with recency bookkeeping
    pub tracked_items: usize,
    /// Pieces currently pinned by readers
    pub pinned_pieces: usize,
    /// Successful slot claims
    pub claims: u64,
    /// Claims that found no slot
    pub claim_failures: u64,
    /// Slots reclaimed by the eviction policy
    pub evictions: u64,
    /// Explicit slot releases
    pub releases: u64,
    /// Reads served from the pool
    pub read_hits: u64,
    /// Reads rejected for missing data
    pub read_misses: u64,
    /// Fraction of reads served, between 0 and 1
    pub hit_rate: f64,
}

impl CacheStatistics {
    /// Calculate hit rate as a fraction of all reads
    pub fn calculate_hit_rate(hits: u64, misses: u64) -> f64 {
        if hits + misses == 0 {
            0.0
        } else {
            (hits as f64) / ((hits + misses) as f64)
        }
    }

    /// Fraction of pool capacity holding written data
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.filled_bytes as f64 / self.capacity_bytes as f64
        }
    }
}

impl Cache {
    /// Get pool statistics
    pub fn statistics(&self) -> CacheStatistics {
        let pool = self.lock_pool();
        let filled_bytes = pool
            .occupied
            .keys()
            .filter_map(|key| pool.items.peek(key))
            .map(|item| item.size)
            .sum::<u64>();

        let mut stats = CacheStatistics {
            slot_count: self.config().slot_count,
            occupied_slots: pool.occupied.len(),
            filled_bytes,
            capacity_bytes: self.config().memory_budget(),
            tracked_items: pool.items.len(),
            pinned_pieces: pool.pins.len(),
            ..Default::default()
        };
        drop(pool);

        self.counters.fill(&mut stats);
        stats
    }
}

/// Activity counters updated outside the pool lock
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) claims: AtomicU64,
    pub(crate) claim_failures: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) releases: AtomicU64,
    pub(crate) read_hits: AtomicU64,
    pub(crate) read_misses: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy counters into `stats`
    pub(crate) fn fill(&self, stats: &mut CacheStatistics) {
        stats.claims = self.claims.load(Ordering::Relaxed);
        stats.claim_failures = self.claim_failures.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.releases = self.releases.load(Ordering::Relaxed);
        stats.read_hits = self.read_hits.load(Ordering::Relaxed);
        stats.read_misses = self.read_misses.load(Ordering::Relaxed);
        stats.hit_rate = CacheStatistics::calculate_hit_rate(stats.read_hits, stats.read_misses);
    }
}
