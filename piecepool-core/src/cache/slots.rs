//! Slot table and recency bookkeeping guarded by the pool lock

use std::collections::HashMap;
use std::time::Instant;

use lru::LruCache;

use super::eviction::EvictionCandidate;
use crate::torrent::{InfoHash, PieceKey};

/// Recency bookkeeping for one piece
///
/// Kept across slot releases so a piece is ranked fairly when it claims a
/// slot again. Removed only when its torrent is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemState {
    /// Bytes of the piece written so far
    pub size: u64,
    /// Last read or write touching the piece
    pub last_access: Instant,
}

impl Default for ItemState {
    fn default() -> Self {
        Self {
            size: 0,
            last_access: Instant::now(),
        }
    }
}

/// Proof that a piece occupies a slot
///
/// Valid while the slot's occupant carries the same key and generation.
/// Releasing or evicting the slot invalidates every outstanding lease for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLease {
    pub(super) index: usize,
    pub(super) generation: u64,
}

impl SlotLease {
    /// Slot position in the pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Claim generation the lease was issued for
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// An open torrent as known to the pool
///
/// Each registration gets a fresh epoch, so pieces built for an earlier
/// registration of the same info hash stay out of range after a reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Number of pieces in the torrent
    pub piece_count: u32,
    /// Registration the pieces were built for
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Occupant {
    pub(super) key: PieceKey,
    pub(super) generation: u64,
}

/// State guarded by the pool lock
pub(crate) struct PoolState {
    pub(super) slots: Vec<Option<Occupant>>,
    pub(super) occupied: HashMap<PieceKey, usize>,
    pub(super) items: LruCache<PieceKey, ItemState>,
    pub(super) torrents: HashMap<InfoHash, Registration>,
    pub(super) pins: HashMap<PieceKey, usize>,
    next_generation: u64,
    next_epoch: u64,
}

impl PoolState {
    pub(super) fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![None; slot_count],
            occupied: HashMap::new(),
            items: LruCache::unbounded(),
            torrents: HashMap::new(),
            pins: HashMap::new(),
            next_generation: 0,
            next_epoch: 0,
        }
    }

    /// Whether `lease` still binds its slot to `key`
    pub(crate) fn is_current(&self, key: PieceKey, lease: SlotLease) -> bool {
        matches!(
            self.slots.get(lease.index),
            Some(Some(occupant)) if occupant.key == key && occupant.generation == lease.generation
        )
    }

    /// Whether the piece belongs to registration `epoch` of its torrent and
    /// lies in its range
    pub(crate) fn contains_piece(&self, key: PieceKey, epoch: u64) -> bool {
        self.torrents.get(&key.info_hash).is_some_and(|registration| {
            registration.epoch == epoch && key.index.as_u32() < registration.piece_count
        })
    }

    pub(super) fn register(&mut self, info_hash: InfoHash, piece_count: u32) -> Registration {
        self.next_epoch += 1;
        let registration = Registration {
            piece_count,
            epoch: self.next_epoch,
        };
        self.torrents.insert(info_hash, registration);
        registration
    }

    /// Fetch-or-default the item for `key`, promote it, and apply `mutator`
    pub(crate) fn update_item<F>(&mut self, key: PieceKey, mutator: F)
    where
        F: FnOnce(&mut ItemState, bool),
    {
        let existed = self.items.contains(&key);
        if !existed {
            self.items.put(key, ItemState::default());
        }
        if let Some(item) = self.items.get_mut(&key) {
            mutator(item, existed);
        }
    }

    pub(super) fn occupy(&mut self, index: usize, key: PieceKey) -> SlotLease {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slots[index] = Some(Occupant { key, generation });
        self.occupied.insert(key, index);
        SlotLease { index, generation }
    }

    pub(super) fn vacate(&mut self, index: usize) -> Option<PieceKey> {
        let occupant = self.slots.get_mut(index)?.take()?;
        self.occupied.remove(&occupant.key);
        Some(occupant.key)
    }

    pub(super) fn is_pinned(&self, key: &PieceKey) -> bool {
        self.pins.contains_key(key)
    }

    /// Occupied slots eligible for reclamation, coldest first
    pub(super) fn eviction_candidates(&self, claimant: PieceKey) -> Vec<EvictionCandidate> {
        self.items
            .iter()
            .rev()
            .filter(|(key, _)| **key != claimant && !self.is_pinned(key))
            .filter_map(|(key, item)| {
                self.occupied.get(key).map(|&slot| EvictionCandidate {
                    slot,
                    key: *key,
                    item: *item,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    fn create_test_key(index: u32) -> PieceKey {
        PieceKey::new(InfoHash::new([1u8; 20]), PieceIndex::new(index))
    }

    #[test]
    fn test_occupy_issues_fresh_generations() {
        let mut pool = PoolState::new(1);
        let key = create_test_key(0);

        let first = pool.occupy(0, key);
        assert!(pool.is_current(key, first));
        assert_eq!(pool.vacate(0), Some(key));
        assert!(!pool.is_current(key, first));

        let second = pool.occupy(0, key);
        assert_ne!(first.generation(), second.generation());
        assert!(!pool.is_current(key, first));
        assert!(!pool.is_current(create_test_key(1), second));
    }

    #[test]
    fn test_vacate_empty_slot() {
        let mut pool = PoolState::new(2);
        assert_eq!(pool.vacate(1), None);
        assert_eq!(pool.vacate(5), None);
    }

    #[test]
    fn test_contains_piece_requires_open_torrent() {
        let mut pool = PoolState::new(1);
        let key = create_test_key(2);

        assert!(!pool.contains_piece(key, 1));
        let registration = pool.register(key.info_hash, 3);
        assert!(pool.contains_piece(key, registration.epoch));
        assert!(!pool.contains_piece(create_test_key(3), registration.epoch));
    }

    #[test]
    fn test_reregistration_starts_new_epoch() {
        let mut pool = PoolState::new(1);
        let key = create_test_key(0);

        let first = pool.register(key.info_hash, 2);
        pool.torrents.remove(&key.info_hash);
        let second = pool.register(key.info_hash, 2);

        assert_ne!(first.epoch, second.epoch);
        assert!(!pool.contains_piece(key, first.epoch));
        assert!(pool.contains_piece(key, second.epoch));
    }

    #[test]
    fn test_candidates_ordered_coldest_first() {
        let mut pool = PoolState::new(3);
        for index in 0..3 {
            let key = create_test_key(index);
            pool.occupy(index as usize, key);
            pool.update_item(key, |_, _| {});
        }
        pool.update_item(create_test_key(0), |item, _| item.last_access = Instant::now());
        pool.pins.insert(create_test_key(2), 1);

        let candidates = pool.eviction_candidates(create_test_key(9));
        let keys: Vec<PieceKey> = candidates.iter().map(|candidate| candidate.key).collect();

        assert_eq!(keys, vec![create_test_key(1), create_test_key(0)]);
        let claimant = create_test_key(1);
        assert!(
            pool.eviction_candidates(claimant)
                .iter()
                .all(|candidate| candidate.key != claimant)
        );
    }

    #[test]
    fn test_update_item_reports_existence() {
        let mut pool = PoolState::new(1);
        let key = create_test_key(3);
        let mut seen = Vec::new();

        pool.update_item(key, |_, existed| seen.push(existed));
        pool.update_item(key, |item, existed| {
            seen.push(existed);
            item.size = 42;
        });

        assert_eq!(seen, vec![false, true]);
        assert_eq!(pool.items.peek(&key).map(|item| item.size), Some(42));
    }
}
