//! Storage layer seen by the torrent engine.
//!
//! Defines the per-piece storage interface the engine drives and a
//! per-torrent facade that creates one cache-backed piece per index.

use std::sync::Arc;

use tracing::info;

use crate::cache::{Cache, CacheError, Piece, PieceIdentity};
use crate::torrent::{InfoHash, PieceIndex, PieceKey, TorrentLayout};

/// Completion state reported to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Piece holds all of its data and was marked complete
    pub complete: bool,
    /// Completion state is known
    pub ok: bool,
}

/// Storage operations for a single torrent piece.
///
/// The engine writes blocks as they arrive from peers, reads them back for
/// playback or upload, and flips completion after hash checking.
pub trait PieceStorage: Send + Sync {
    /// Reports whether the piece is complete.
    fn completion(&self) -> Completion;

    /// Marks the piece complete after verification.
    fn mark_complete(&self);

    /// Marks the piece as needing to be fetched again.
    fn mark_not_complete(&self);

    /// Stores `data` at `offset` within the piece.
    ///
    /// # Errors
    ///
    /// - `CacheError::RangeViolation` - If the write extends past the piece
    /// - `CacheError::BufferUnavailable` - If no buffer could be obtained
    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, CacheError>;

    /// Fills `buf` with piece data starting at `offset`.
    ///
    /// # Errors
    ///
    /// - `CacheError::IncompleteData` - If part of the range was never written
    /// - `CacheError::EndOfData` - If the range cannot be satisfied in full
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError>;

    /// Drops the piece's data and frees its buffer.
    fn release(&self);
}

impl PieceStorage for Piece {
    fn completion(&self) -> Completion {
        Piece::completion(self)
    }

    fn mark_complete(&self) {
        Piece::mark_complete(self)
    }

    fn mark_not_complete(&self) {
        Piece::mark_not_complete(self)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, CacheError> {
        Piece::write_at(self, data, offset)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        Piece::read_at(self, buf, offset)
    }

    fn release(&self) {
        Piece::release(self)
    }
}

/// Cache-backed storage for every piece of one torrent.
#[derive(Debug)]
pub struct TorrentStorage {
    cache: Arc<Cache>,
    info_hash: InfoHash,
    layout: TorrentLayout,
    pieces: Vec<Arc<Piece>>,
}

impl Cache {
    /// Opens storage for a torrent, creating one unassigned piece per index.
    ///
    /// # Errors
    ///
    /// - `CacheError::PieceTooLarge` - If the piece length exceeds the slot size
    /// - `CacheError::TorrentAlreadyOpen` - If the torrent is already open
    pub fn open_torrent(
        self: &Arc<Self>,
        info_hash: InfoHash,
        layout: TorrentLayout,
    ) -> Result<TorrentStorage, CacheError> {
        if layout.piece_length > self.slot_size() as u64 {
            return Err(CacheError::PieceTooLarge {
                length: layout.piece_length,
                slot_size: self.slot_size(),
            });
        }

        let piece_count = layout.piece_count();
        let registration = self.register_torrent(info_hash, piece_count)?;
        let pieces = (0..piece_count)
            .map(PieceIndex::new)
            .map(|index| {
                let identity = PieceIdentity {
                    key: PieceKey::new(info_hash, index),
                    length: layout.piece_size(index),
                    hash: layout.piece_hash(index),
                };
                Piece::registered(Arc::clone(self), identity, registration.epoch).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>();
        let pieces = match pieces {
            Ok(pieces) => pieces,
            Err(error) => {
                self.close_torrent(info_hash);
                return Err(error);
            }
        };

        info!(
            "Opened torrent {}: {} pieces of {} bytes ({} bytes total)",
            info_hash, piece_count, layout.piece_length, layout.total_length
        );

        Ok(TorrentStorage {
            cache: Arc::clone(self),
            info_hash,
            layout,
            pieces,
        })
    }
}

impl TorrentStorage {
    /// Torrent this storage belongs to.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Piece geometry of the torrent.
    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    /// Piece at `index`, if it exists.
    pub fn piece(&self, index: PieceIndex) -> Option<Arc<Piece>> {
        self.pieces.get(index.as_u32() as usize).cloned()
    }

    /// All pieces in index order.
    pub fn pieces(&self) -> &[Arc<Piece>] {
        &self.pieces
    }

    /// Indices of pieces currently reporting completion.
    pub fn completed_pieces(&self) -> Vec<PieceIndex> {
        self.pieces
            .iter()
            .filter(|piece| piece.completion().complete)
            .map(|piece| piece.index())
            .collect()
    }

    /// Fills `buf` with torrent data starting at torrent `offset`.
    ///
    /// The range may span several pieces. Either the whole buffer is filled
    /// or an error is returned.
    ///
    /// # Errors
    ///
    /// - `CacheError::IncompleteData` - If any piece in the range lacks the data
    /// - `CacheError::EndOfData` - If the range extends past the torrent
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        let piece_length = self.layout.piece_length;
        let mut filled = 0;

        while filled < buf.len() {
            let position = offset + filled as u64;
            let index = PieceIndex::new((position / piece_length.max(1)) as u32);
            let Some(piece) = self.pieces.get(index.as_u32() as usize) else {
                return Err(CacheError::EndOfData {
                    key: PieceKey::new(self.info_hash, index),
                    offset: position,
                    requested: (buf.len() - filled) as u64,
                });
            };

            let piece_offset = position - self.layout.piece_offset(index);
            let available = piece.length().saturating_sub(piece_offset) as usize;
            let take = available.min(buf.len() - filled);
            if take == 0 {
                return Err(CacheError::EndOfData {
                    key: piece.key(),
                    offset: piece_offset,
                    requested: (buf.len() - filled) as u64,
                });
            }

            piece.read_at(&mut buf[filled..filled + take], piece_offset)?;
            filled += take;
        }

        Ok(filled)
    }

    /// Closes the torrent, freeing every slot its pieces hold.
    ///
    /// Pieces handed out earlier stay valid objects but can no longer read
    /// or write, including after the same torrent is opened again.
    pub fn close(self) -> usize {
        let freed = self.cache.close_torrent(self.info_hash);
        info!("Closed torrent {} ({} slots freed)", self.info_hash, freed);
        freed
    }
}
