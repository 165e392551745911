//! Slot pool manager
//!
//! Owns the fixed table of slot buffers. Slot occupancy, recency, known
//! torrents and reader pins live behind one pool-wide lock; each slot buffer
//! has its own lock so copies run without holding the pool.

use std::fmt;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::eviction::EvictionPolicy;
use super::slots::{ItemState, PoolState, Registration, SlotLease};
use super::stats::CacheCounters;
use super::CacheError;
use crate::config::CacheConfig;
use crate::torrent::{InfoHash, PieceKey};

/// Bounded pool of piece-sized buffers shared by all open torrents
pub struct Cache {
    config: CacheConfig,
    pool: Mutex<PoolState>,
    buffers: Box<[Mutex<Box<[u8]>>]>,
    policy: Box<dyn EvictionPolicy>,
    pub(crate) counters: CacheCounters,
}

impl Cache {
    /// Create a pool using the eviction mode from `config`
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidConfiguration` - If the configuration fails validation
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let policy = config.eviction.build_policy();
        Self::with_policy(config, policy)
    }

    /// Create a pool with a custom eviction policy
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidConfiguration` - If the configuration fails validation
    pub fn with_policy(
        config: CacheConfig,
        policy: Box<dyn EvictionPolicy>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let buffers = (0..config.slot_count)
            .map(|_| Mutex::new(vec![0u8; config.slot_size].into_boxed_slice()))
            .collect();

        debug!(
            "Created piece pool: {} slots of {} bytes, chunk size {}, eviction {}",
            config.slot_count,
            config.slot_size,
            config.chunk_size,
            policy.name()
        );

        Ok(Self {
            pool: Mutex::new(PoolState::new(config.slot_count)),
            buffers,
            policy,
            counters: CacheCounters::default(),
            config,
        })
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Coverage tracking unit shared by all pieces
    pub fn chunk_size(&self) -> u32 {
        self.config.chunk_size
    }

    /// Capacity of each slot buffer in bytes
    pub fn slot_size(&self) -> usize {
        self.config.slot_size
    }

    /// Apply `mutator` to the recency entry of `key`, creating it if needed
    ///
    /// The mutator receives whether the entry existed before the call.
    pub fn update_item<F>(&self, key: PieceKey, mutator: F)
    where
        F: FnOnce(&mut ItemState, bool),
    {
        self.lock_pool().update_item(key, mutator);
    }

    /// Recency entry of `key` without touching its rank
    pub fn item(&self, key: PieceKey) -> Option<ItemState> {
        self.lock_pool().items.peek(&key).copied()
    }

    /// Bind a slot to `key`, reclaiming one through the policy if none is free
    ///
    /// Returns `None` when `key` is already bound to a slot, since that lease
    /// belongs to its holder, or when the pool is exhausted and the policy
    /// declines.
    pub fn claim_slot(&self, key: PieceKey) -> Option<SlotLease> {
        let mut pool = self.lock_pool();
        self.claim_locked(&mut pool, key)
    }

    /// Return the slot held under `lease` to the pool
    ///
    /// Stale leases are ignored. Recency entries are kept.
    pub fn release_slot(&self, lease: SlotLease) {
        let mut pool = self.lock_pool();
        self.release_locked(&mut pool, lease);
    }

    /// Piece currently bound to `slot`
    pub fn occupant(&self, slot: usize) -> Option<PieceKey> {
        let pool = self.lock_pool();
        pool.slots.get(slot).copied().flatten().map(|occupant| occupant.key)
    }

    /// Number of slots bound to a piece
    pub fn occupied_slots(&self) -> usize {
        self.lock_pool().occupied.len()
    }

    /// Make pieces `0..piece_count` of `info_hash` known to the pool
    ///
    /// Every registration gets a new epoch. Pieces are bound to the epoch
    /// they were created under.
    ///
    /// # Errors
    ///
    /// - `CacheError::TorrentAlreadyOpen` - If the torrent is already registered
    pub fn register_torrent(
        &self,
        info_hash: InfoHash,
        piece_count: u32,
    ) -> Result<Registration, CacheError> {
        let mut pool = self.lock_pool();
        if pool.torrents.contains_key(&info_hash) {
            return Err(CacheError::TorrentAlreadyOpen { info_hash });
        }
        Ok(pool.register(info_hash, piece_count))
    }

    /// Current registration of `info_hash`, if the torrent is open
    pub fn registration(&self, info_hash: InfoHash) -> Option<Registration> {
        self.lock_pool().torrents.get(&info_hash).copied()
    }

    /// Forget a torrent, freeing its slots, recency entries and pins
    ///
    /// Returns the number of slots freed.
    pub fn close_torrent(&self, info_hash: InfoHash) -> usize {
        let mut pool = self.lock_pool();
        pool.torrents.remove(&info_hash);

        let slots: Vec<usize> = pool
            .occupied
            .iter()
            .filter(|(key, _)| key.info_hash == info_hash)
            .map(|(_, &slot)| slot)
            .collect();
        for &slot in &slots {
            pool.vacate(slot);
            CacheCounters::record(&self.counters.releases);
        }

        let keys: Vec<PieceKey> = pool
            .items
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| key.info_hash == info_hash)
            .collect();
        for key in &keys {
            pool.items.pop(key);
        }
        pool.pins.retain(|key, _| key.info_hash != info_hash);

        debug!(
            "Closed torrent {}: freed {} slots, dropped {} recency entries",
            info_hash,
            slots.len(),
            keys.len()
        );

        slots.len()
    }

    /// Reserve `key` for a reader so eviction skips it
    ///
    /// Pins are counted; each call needs a matching [`Cache::unpin`].
    pub fn pin(&self, key: PieceKey) {
        *self.lock_pool().pins.entry(key).or_insert(0) += 1;
    }

    /// Drop one reader reservation of `key`
    pub fn unpin(&self, key: PieceKey) {
        let mut pool = self.lock_pool();
        if let Some(count) = pool.pins.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                pool.pins.remove(&key);
            }
        }
    }

    /// Whether `key` is pinned by at least one reader
    pub fn is_pinned(&self, key: PieceKey) -> bool {
        self.lock_pool().is_pinned(&key)
    }

    pub(crate) fn lock_pool(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock()
    }

    pub(crate) fn buffer(&self, slot: usize) -> &Mutex<Box<[u8]>> {
        &self.buffers[slot]
    }

    pub(crate) fn record_read(&self, hit: bool) {
        match hit {
            true => CacheCounters::record(&self.counters.read_hits),
            false => CacheCounters::record(&self.counters.read_misses),
        }
    }

    pub(crate) fn claim_locked(&self, pool: &mut PoolState, key: PieceKey) -> Option<SlotLease> {
        if let Some(&index) = pool.occupied.get(&key) {
            debug!("Piece {} already holds slot {}", key, index);
            return None;
        }

        let index = match pool.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                let candidates = pool.eviction_candidates(key);
                let Some(victim) = self
                    .policy
                    .select_victim(&candidates)
                    .and_then(|position| candidates.get(position))
                else {
                    CacheCounters::record(&self.counters.claim_failures);
                    warn!(
                        "No free slot for piece {} ({} of {} slots occupied)",
                        key,
                        pool.occupied.len(),
                        self.config.slot_count
                    );
                    return None;
                };

                pool.vacate(victim.slot);
                CacheCounters::record(&self.counters.evictions);
                debug!(
                    "Evicted piece {} from slot {} for piece {} (idle {:?})",
                    victim.key,
                    victim.slot,
                    key,
                    victim.item.last_access.elapsed()
                );
                victim.slot
            }
        };

        let lease = pool.occupy(index, key);
        pool.update_item(key, |item, _| {
            item.size = 0;
            item.last_access = Instant::now();
        });
        CacheCounters::record(&self.counters.claims);

        debug!("Assigned slot {} to piece {}", index, key);
        Some(lease)
    }

    pub(crate) fn release_locked(&self, pool: &mut PoolState, lease: SlotLease) {
        let current = pool
            .slots
            .get(lease.index)
            .copied()
            .flatten()
            .filter(|occupant| occupant.generation == lease.generation);

        if let Some(occupant) = current {
            pool.vacate(lease.index);
            CacheCounters::record(&self.counters.releases);
            debug!("Released slot {} from piece {}", lease.index, occupant.key);
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::eviction::LeastRecentlyUsed;
    use crate::torrent::PieceIndex;

    fn create_test_info_hash() -> InfoHash {
        InfoHash::new([1u8; 20])
    }

    fn create_test_key(index: u32) -> PieceKey {
        PieceKey::new(create_test_info_hash(), PieceIndex::new(index))
    }

    fn create_test_cache(slot_count: usize) -> Cache {
        Cache::new(CacheConfig::for_pieces(slot_count, 32768)).unwrap()
    }

    #[test]
    fn test_claim_takes_first_free_slot() {
        let cache = create_test_cache(2);

        let first = cache.claim_slot(create_test_key(0)).unwrap();
        let second = cache.claim_slot(create_test_key(1)).unwrap();

        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(cache.occupant(0), Some(create_test_key(0)));
        assert_eq!(cache.occupied_slots(), 2);
    }

    #[test]
    fn test_claim_fails_when_exhausted_without_eviction() {
        let cache = create_test_cache(1);

        assert!(cache.claim_slot(create_test_key(0)).is_some());
        assert!(cache.claim_slot(create_test_key(1)).is_none());

        let stats = cache.statistics();
        assert_eq!(stats.claims, 1);
        assert_eq!(stats.claim_failures, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_claim_refuses_key_already_bound() {
        let cache = create_test_cache(2);

        let lease = cache.claim_slot(create_test_key(0)).unwrap();
        assert_eq!(cache.claim_slot(create_test_key(0)), None);
        assert_eq!(cache.occupied_slots(), 1);
        assert_eq!(cache.occupant(1), None);

        cache.release_slot(lease);
        assert!(cache.claim_slot(create_test_key(0)).is_some());
    }

    #[test]
    fn test_release_frees_slot_and_keeps_recency() {
        let cache = create_test_cache(1);
        let key = create_test_key(0);

        let lease = cache.claim_slot(key).unwrap();
        cache.update_item(key, |item, _| item.size = 100);
        cache.release_slot(lease);

        assert_eq!(cache.occupant(0), None);
        assert_eq!(cache.item(key).map(|item| item.size), Some(100));
        assert!(cache.claim_slot(create_test_key(1)).is_some());
    }

    #[test]
    fn test_stale_lease_release_is_ignored() {
        let cache = create_test_cache(1);

        let stale = cache.claim_slot(create_test_key(0)).unwrap();
        cache.release_slot(stale);
        let fresh = cache.claim_slot(create_test_key(1)).unwrap();

        assert_eq!(stale.index(), fresh.index());
        assert_ne!(stale.generation(), fresh.generation());

        cache.release_slot(stale);
        assert_eq!(cache.occupant(0), Some(create_test_key(1)));
    }

    #[test]
    fn test_lru_eviction_reclaims_coldest_slot() {
        let config = CacheConfig::for_pieces(2, 32768);
        let cache = Cache::with_policy(config, Box::new(LeastRecentlyUsed::new())).unwrap();

        cache.claim_slot(create_test_key(0)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.claim_slot(create_test_key(1)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.update_item(create_test_key(0), |item, _| item.last_access = Instant::now());

        let lease = cache.claim_slot(create_test_key(2)).unwrap();

        assert_eq!(lease.index(), 1);
        assert_eq!(cache.occupant(1), Some(create_test_key(2)));
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_pinned_piece_is_not_evicted() {
        let config = CacheConfig::for_pieces(1, 32768);
        let cache = Cache::with_policy(config, Box::new(LeastRecentlyUsed::new())).unwrap();
        let key = create_test_key(0);

        cache.claim_slot(key).unwrap();
        cache.pin(key);
        cache.pin(key);
        assert!(cache.claim_slot(create_test_key(1)).is_none());

        cache.unpin(key);
        assert!(cache.is_pinned(key));
        cache.unpin(key);
        assert!(!cache.is_pinned(key));
        assert!(cache.claim_slot(create_test_key(1)).is_some());
    }

    #[test]
    fn test_register_and_close_torrent() {
        let cache = create_test_cache(2);
        let info_hash = create_test_info_hash();
        let other = PieceKey::new(InfoHash::new([2u8; 20]), PieceIndex::new(0));

        let registration = cache.register_torrent(info_hash, 4).unwrap();
        let epoch = registration.epoch;
        assert!(matches!(
            cache.register_torrent(info_hash, 4),
            Err(CacheError::TorrentAlreadyOpen { .. })
        ));
        assert_eq!(cache.registration(info_hash), Some(registration));
        assert!(cache.lock_pool().contains_piece(create_test_key(3), epoch));
        assert!(!cache.lock_pool().contains_piece(create_test_key(4), epoch));

        cache.claim_slot(create_test_key(0)).unwrap();
        cache.claim_slot(other).unwrap();
        cache.pin(create_test_key(0));

        assert_eq!(cache.close_torrent(info_hash), 1);
        assert_eq!(cache.occupant(0), None);
        assert_eq!(cache.occupant(1), Some(other));
        assert!(cache.item(create_test_key(0)).is_none());
        assert!(!cache.is_pinned(create_test_key(0)));
        assert!(!cache.lock_pool().contains_piece(create_test_key(0), epoch));
        assert_eq!(cache.registration(info_hash), None);

        let reopened = cache.register_torrent(info_hash, 4).unwrap();
        assert!(reopened.epoch > epoch);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let result = Cache::new(CacheConfig::for_pieces(0, 32768));
        assert!(matches!(
            result,
            Err(CacheError::InvalidConfiguration { .. })
        ));
    }
}
