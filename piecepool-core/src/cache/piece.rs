//! Per-piece state machine over a pool slot
//!
//! A piece starts unassigned, claims a slot on its first write, tracks which
//! chunks it has received, and returns the slot on release. Reads are served
//! only for chunks fully covered by earlier writes and never return partial
//! data.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::chunk_map::ChunkMap;
use super::pool::Cache;
use super::slots::{PoolState, SlotLease};
use super::{CacheError, chunk};
use crate::storage::Completion;
use crate::torrent::{PieceIndex, PieceKey};

/// Identity and expected content of a piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceIdentity {
    /// Torrent and index of the piece
    pub key: PieceKey,
    /// Expected content length in bytes
    pub length: u64,
    /// Expected SHA-1 of the content, if known
    pub hash: Option<[u8; 20]>,
}

#[derive(Debug)]
struct PieceState {
    lease: Option<SlotLease>,
    size: u64,
    completed: bool,
    chunks: ChunkMap,
}

impl PieceState {
    fn activate(&mut self, lease: SlotLease) {
        self.lease = Some(lease);
        self.size = 0;
        self.completed = false;
        self.chunks.clear();
    }

    fn deactivate(&mut self) {
        self.lease = None;
        self.size = 0;
        self.completed = false;
        self.chunks.clear();
    }
}

/// One torrent piece backed by a slot of the shared pool
///
/// A piece belongs to the torrent registration it was created under. Once
/// that torrent is closed the piece stays out of range, even if the same
/// info hash is opened again.
pub struct Piece {
    cache: Arc<Cache>,
    identity: PieceIdentity,
    epoch: u64,
    state: Mutex<PieceState>,
}

impl Piece {
    /// Create an unassigned piece of the currently open torrent
    ///
    /// # Errors
    ///
    /// - `CacheError::PieceOutOfRange` - If the torrent is not open or the index is past its end
    /// - `CacheError::PieceTooLarge` - If the piece cannot fit in one slot
    pub fn new(cache: Arc<Cache>, identity: PieceIdentity) -> Result<Self, CacheError> {
        let key = identity.key;
        let registration = cache
            .registration(key.info_hash)
            .filter(|registration| key.index.as_u32() < registration.piece_count)
            .ok_or(CacheError::PieceOutOfRange { key })?;
        Self::registered(cache, identity, registration.epoch)
    }

    pub(crate) fn registered(
        cache: Arc<Cache>,
        identity: PieceIdentity,
        epoch: u64,
    ) -> Result<Self, CacheError> {
        if identity.length > cache.slot_size() as u64 {
            return Err(CacheError::PieceTooLarge {
                length: identity.length,
                slot_size: cache.slot_size(),
            });
        }

        let chunks = ChunkMap::new(chunk::chunk_count(identity.length, cache.chunk_size()));
        Ok(Self {
            cache,
            identity,
            epoch,
            state: Mutex::new(PieceState {
                lease: None,
                size: 0,
                completed: false,
                chunks,
            }),
        })
    }

    /// Key identifying the piece in the pool
    pub fn key(&self) -> PieceKey {
        self.identity.key
    }

    /// Position of the piece within its torrent
    pub fn index(&self) -> PieceIndex {
        self.identity.key.index
    }

    /// Expected content length in bytes
    pub fn length(&self) -> u64 {
        self.identity.length
    }

    /// Identity the piece was created with
    pub fn identity(&self) -> &PieceIdentity {
        &self.identity
    }

    /// Whether the piece currently holds a slot
    pub fn is_active(&self) -> bool {
        let mut state = self.state.lock();
        let pool = self.cache.lock_pool();
        self.refresh_lease(&mut state, &pool).is_some()
    }

    /// Bytes of fully written chunks
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Covered and total chunk counts
    pub fn chunk_progress(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.chunks.covered_count(), state.chunks.chunk_count())
    }

    /// Completion as seen by the torrent engine
    ///
    /// Complete only while the piece holds its slot, was marked complete, and
    /// every byte has been written.
    pub fn completion(&self) -> Completion {
        let mut state = self.state.lock();
        let active = {
            let pool = self.cache.lock_pool();
            self.refresh_lease(&mut state, &pool).is_some()
        };
        let length = self.identity.length;

        Completion {
            complete: active && state.completed && state.size == length && length > 0,
            ok: true,
        }
    }

    /// Mark the piece as complete
    ///
    /// # Panics
    ///
    /// If the piece holds no slot, has not been fully written, or is empty.
    /// Calling this early is a caller bug, not a recoverable condition.
    pub fn mark_complete(&self) {
        let mut state = self.state.lock();
        let active = {
            let pool = self.cache.lock_pool();
            self.refresh_lease(&mut state, &pool).is_some()
        };
        let length = self.identity.length;

        if !active || state.size != length || length == 0 {
            panic!(
                "piece {} is not complete: active={}, size={}, length={}",
                self.identity.key, active, state.size, length
            );
        }

        state.completed = true;
        debug!("Piece {} marked complete", self.identity.key);
    }

    /// Clear the completed flag, keeping written data and coverage
    pub fn mark_not_complete(&self) {
        self.state.lock().completed = false;
        debug!("Piece {} marked not complete", self.identity.key);
    }

    /// Make sure a buffer is available for the next operation
    ///
    /// Writes claim a slot if the piece has none. Reads never claim: an
    /// unassigned piece in range still reports `true` and its reads fail on
    /// coverage instead. Returns `false` for pieces outside the known range
    /// and for writes when no slot can be claimed.
    pub fn ensure_buffer(&self, for_write: bool) -> bool {
        let mut state = self.state.lock();
        let mut pool = self.cache.lock_pool();

        match for_write {
            true => self.writable_lease(&mut state, &mut pool).is_ok(),
            false => self.active_lease(&mut state, &pool).is_ok(),
        }
    }

    /// Write `data` at `offset` within the piece
    ///
    /// Claims a slot on the first write. A chunk becomes readable once every
    /// byte of it has been written, by this call or by earlier partial writes.
    ///
    /// # Errors
    ///
    /// - `CacheError::RangeViolation` - If the write extends past the piece length
    /// - `CacheError::PieceOutOfRange` - If the piece's torrent is not open
    /// - `CacheError::BufferUnavailable` - If no slot could be claimed
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, CacheError> {
        let key = self.identity.key;
        let length = self.identity.length;
        let len = data.len() as u64;

        let mut state = self.state.lock();
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= length)
            .ok_or(CacheError::RangeViolation {
                key,
                offset,
                len,
                capacity: length,
            })?;

        let mut pool = self.cache.lock_pool();
        let lease = match self.writable_lease(&mut state, &mut pool) {
            Ok(lease) => lease,
            Err(error) => {
                debug!("Can't get buffer to write piece {}: {}", key, error);
                return Err(error);
            }
        };

        let chunk_size = self.cache.chunk_size();
        let whole = chunk::fully_covered(offset, len, length, chunk_size);
        let mut added = 0;
        for chunk_index in chunk::covering(offset, len, chunk_size) {
            let chunk_length = chunk::chunk_length(chunk_index, length, chunk_size);
            let covered = match whole.contains(&chunk_index) {
                true => state.chunks.insert(chunk_index),
                false => {
                    let written = chunk::written_within(chunk_index, offset, len, length, chunk_size);
                    state.chunks.record(chunk_index, written, chunk_length as u32)
                }
            };
            if covered {
                added += chunk_length;
            }
        }
        state.size += added;

        let size = state.size;
        pool.update_item(key, |item, _| {
            item.size = size;
            item.last_access = Instant::now();
        });

        let mut buffer = self.cache.buffer(lease.index()).lock();
        drop(pool);
        buffer[offset as usize..end as usize].copy_from_slice(data);

        Ok(data.len())
    }

    /// Fill `buf` with piece data starting at `offset`
    ///
    /// All or nothing: either the whole buffer is filled or an error is
    /// returned and `buf` is left untouched.
    ///
    /// Coverage is checked over the part of the range inside the piece
    /// before the range is checked against the piece end.
    ///
    /// # Errors
    ///
    /// - `CacheError::IncompleteData` - If any chunk in the range was not fully written,
    ///   including in-range reads of a piece that holds no slot
    /// - `CacheError::EndOfData` - If the range extends past the piece or the piece is
    ///   outside the known range
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        let key = self.identity.key;
        let length = self.identity.length;
        let len = buf.len() as u64;
        let end_of_data = CacheError::EndOfData {
            key,
            offset,
            requested: len,
        };

        let mut state = self.state.lock();
        let mut pool = self.cache.lock_pool();
        let Ok(lease) = self.active_lease(&mut state, &pool) else {
            debug!("No buffer to read piece {}", key);
            return Err(end_of_data);
        };

        let end = offset.saturating_add(len);
        let inside = end.min(length).saturating_sub(offset);
        let span = chunk::covering(offset, inside, self.cache.chunk_size());
        let missing = match offset < length {
            true => state.chunks.first_missing(span.clone()),
            false => None,
        };
        if missing.is_some() || (lease.is_none() && end <= length) {
            self.cache.record_read(false);
            debug!(
                "Piece {} missing chunk {:?} for read of {} bytes at {} (size {}/{}, completed {})",
                key,
                missing,
                len,
                offset,
                state.size,
                length,
                state.completed
            );
            return Err(CacheError::IncompleteData {
                key,
                chunk: missing.unwrap_or(*span.start()),
            });
        }

        let (Some(lease), true) = (lease, end <= length) else {
            debug!("Read past end of piece {}", key);
            return Err(end_of_data);
        };

        pool.update_item(key, |item, _| item.last_access = Instant::now());
        self.cache.record_read(true);

        let buffer = self.cache.buffer(lease.index()).lock();
        drop(pool);
        buf.copy_from_slice(&buffer[offset as usize..end as usize]);

        Ok(buf.len())
    }

    /// Return the slot to the pool and forget all written data
    pub fn release(&self) {
        let mut state = self.state.lock();
        if let Some(lease) = state.lease {
            let mut pool = self.cache.lock_pool();
            self.cache.release_locked(&mut pool, lease);
        }
        state.deactivate();
    }

    /// Check the written content against the expected hash
    ///
    /// Pieces without an expected hash are accepted as is.
    ///
    /// # Errors
    ///
    /// - `CacheError::IncompleteData` - If any chunk of the piece is missing
    pub fn verify(&self) -> Result<bool, CacheError> {
        let key = self.identity.key;
        let mut state = self.state.lock();
        let pool = self.cache.lock_pool();
        let lease = self.refresh_lease(&mut state, &pool);

        let (Some(lease), true) = (lease, state.chunks.is_full()) else {
            let last = state.chunks.chunk_count().saturating_sub(1);
            return Err(CacheError::IncompleteData {
                key,
                chunk: state.chunks.first_missing(0..=last).unwrap_or(0),
            });
        };

        let Some(expected) = self.identity.hash else {
            return Ok(true);
        };

        let buffer = self.cache.buffer(lease.index()).lock();
        drop(pool);
        let digest = Sha1::digest(&buffer[..self.identity.length as usize]);
        let valid = digest.as_slice() == expected.as_slice();

        if !valid {
            debug!("Piece {} failed hash verification", key);
        }
        Ok(valid)
    }

    /// Current lease if the pool still binds it to this piece
    ///
    /// A reclaimed slot resets the piece to unassigned.
    fn refresh_lease(&self, state: &mut PieceState, pool: &PoolState) -> Option<SlotLease> {
        let lease = state.lease?;
        if pool.is_current(self.identity.key, lease) {
            return Some(lease);
        }

        debug!(
            "Piece {} lost slot {}, resetting to unassigned",
            self.identity.key,
            lease.index()
        );
        state.deactivate();
        None
    }

    /// Lease of an active piece, `None` for an unassigned piece in range
    fn active_lease(
        &self,
        state: &mut PieceState,
        pool: &PoolState,
    ) -> Result<Option<SlotLease>, CacheError> {
        if let Some(lease) = self.refresh_lease(state, pool) {
            return Ok(Some(lease));
        }

        match pool.contains_piece(self.identity.key, self.epoch) {
            true => Ok(None),
            false => Err(CacheError::PieceOutOfRange {
                key: self.identity.key,
            }),
        }
    }

    /// Lease of the piece, claiming a slot if it has none
    fn writable_lease(
        &self,
        state: &mut PieceState,
        pool: &mut PoolState,
    ) -> Result<SlotLease, CacheError> {
        if let Some(lease) = self.active_lease(state, pool)? {
            return Ok(lease);
        }

        let key = self.identity.key;
        let lease = self
            .cache
            .claim_locked(pool, key)
            .ok_or(CacheError::BufferUnavailable { key })?;
        state.activate(lease);
        Ok(lease)
    }
}

impl std::fmt::Debug for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("identity", &self.identity)
            .field("state", &*self.state.lock())
            .finish()
    }
}
