//! Slot reclamation policies
//!
//! Consulted by the pool when a claim finds no free slot. A policy only
//! chooses among candidates; the pool performs the release.

use std::time::Duration;

use super::slots::ItemState;
use crate::torrent::PieceKey;

/// Occupied slot that may be reclaimed
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// Slot holding the piece
    pub slot: usize,
    /// Piece occupying the slot
    pub key: PieceKey,
    /// Recency bookkeeping of the piece
    pub item: ItemState,
}

/// Chooses which occupied slot to reclaim when the pool is exhausted.
///
/// Candidates are ordered coldest first and never include pinned pieces or
/// the piece asking for a slot. Implementations run under the pool lock and
/// must not call back into the cache.
pub trait EvictionPolicy: Send + Sync {
    /// Returns the position in `candidates` of the slot to reclaim.
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<usize>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Never reclaims; claims on a full pool fail until a slot is released
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn select_victim(&self, _candidates: &[EvictionCandidate]) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Reclaims the least recently accessed piece
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyUsed {
    min_idle: Duration,
}

impl LeastRecentlyUsed {
    /// Creates a policy that evicts the coldest piece regardless of idle time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy that only evicts pieces idle for at least `min_idle`.
    pub fn with_min_idle(min_idle: Duration) -> Self {
        Self { min_idle }
    }
}

impl EvictionPolicy for LeastRecentlyUsed {
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<usize> {
        let (position, coldest) = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, candidate)| candidate.item.last_access)?;

        (coldest.item.last_access.elapsed() >= self.min_idle).then_some(position)
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}
