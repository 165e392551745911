//! Bounded in-memory piece cache
//!
//! A fixed pool of slot buffers, each large enough for one piece, shared by
//! every piece of every open torrent. Pieces claim a slot on their first write,
//! track which chunks they have received, and serve reads only for chunks that
//! were fully written.
//!
//! Lock order is piece state, then pool, then slot buffer. The pool never
//! takes a piece lock; evicted pieces notice through their stale lease.

pub mod chunk;
pub mod chunk_map;
pub mod eviction;
pub mod piece;
pub mod pool;
pub mod slots;
pub mod stats;

pub use chunk::{ChunkPosition, DEFAULT_CHUNK_SIZE};
pub use chunk_map::ChunkMap;
pub use eviction::{EvictionCandidate, EvictionPolicy, LeastRecentlyUsed, NoEviction};
pub use piece::{Piece, PieceIdentity};
pub use pool::Cache;
pub use slots::{ItemState, Registration, SlotLease};
pub use stats::CacheStatistics;

use crate::torrent::{InfoHash, PieceKey};

/// Errors returned by cache and piece operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No slot could be claimed for a write
    #[error("No buffer available for piece {key}")]
    BufferUnavailable {
        /// Piece that needed a slot
        key: PieceKey,
    },

    /// Requested range includes chunks that were never fully written
    #[error("Piece {key} chunk {chunk} not written yet")]
    IncompleteData {
        /// Piece that was read
        key: PieceKey,
        /// First uncovered chunk in the requested range
        chunk: u32,
    },

    /// Write would fall outside the piece
    #[error("Write of {len} bytes at offset {offset} exceeds piece {key} capacity {capacity}")]
    RangeViolation {
        /// Piece that was written
        key: PieceKey,
        /// Offset of the rejected write
        offset: u64,
        /// Length of the rejected write
        len: u64,
        /// Bytes the piece can hold
        capacity: u64,
    },

    /// Read cannot be satisfied in full
    #[error("End of data reading {requested} bytes at offset {offset} of piece {key}")]
    EndOfData {
        /// Piece that was read
        key: PieceKey,
        /// Offset of the rejected read
        offset: u64,
        /// Number of bytes requested
        requested: u64,
    },

    /// Piece index is not known to the pool
    #[error("Piece {key} is outside the known piece range")]
    PieceOutOfRange {
        /// Unknown piece
        key: PieceKey,
    },

    /// Piece does not fit in a slot
    #[error("Piece length {length} exceeds slot size {slot_size}")]
    PieceTooLarge {
        /// Requested piece length
        length: u64,
        /// Configured slot size
        slot_size: usize,
    },

    /// Torrent is already registered with the pool
    #[error("Torrent {info_hash} is already open")]
    TorrentAlreadyOpen {
        /// Duplicate torrent
        info_hash: InfoHash,
    },

    /// Cache configuration is unusable
    #[error("Invalid cache configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the problem
        reason: String,
    },
}

impl CacheError {
    /// Whether a later retry of the same operation may succeed.
    ///
    /// Missing data and exhausted pools are transient; the rest indicate a
    /// caller defect or a closed torrent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::BufferUnavailable { .. } | CacheError::IncompleteData { .. }
        )
    }
}

impl From<CacheError> for std::io::Error {
    fn from(error: CacheError) -> Self {
        let kind = match &error {
            CacheError::IncompleteData { .. } | CacheError::EndOfData { .. } => {
                std::io::ErrorKind::UnexpectedEof
            }
            CacheError::RangeViolation { .. } | CacheError::PieceTooLarge { .. } => {
                std::io::ErrorKind::InvalidInput
            }
            CacheError::BufferUnavailable { .. } => std::io::ErrorKind::OutOfMemory,
            CacheError::PieceOutOfRange { .. } => std::io::ErrorKind::NotFound,
            CacheError::TorrentAlreadyOpen { .. } => std::io::ErrorKind::AlreadyExists,
            CacheError::InvalidConfiguration { .. } => std::io::ErrorKind::InvalidInput,
        };
        std::io::Error::new(kind, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    fn create_test_key() -> PieceKey {
        PieceKey::new(InfoHash::new([1u8; 20]), PieceIndex::new(0))
    }

    #[test]
    fn test_retryable_errors() {
        let key = create_test_key();

        assert!(CacheError::BufferUnavailable { key }.is_retryable());
        assert!(CacheError::IncompleteData { key, chunk: 1 }.is_retryable());
        assert!(!CacheError::PieceOutOfRange { key }.is_retryable());
    }

    #[test]
    fn test_io_error_kinds() {
        let key = create_test_key();

        let incomplete: std::io::Error = CacheError::IncompleteData { key, chunk: 0 }.into();
        assert_eq!(incomplete.kind(), std::io::ErrorKind::UnexpectedEof);

        let range: std::io::Error = CacheError::RangeViolation {
            key,
            offset: 10,
            len: 10,
            capacity: 15,
        }
        .into();
        assert_eq!(range.kind(), std::io::ErrorKind::InvalidInput);
    }
}
