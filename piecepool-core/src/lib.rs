//! Piecepool Core - Bounded in-memory piece cache for streaming BitTorrent
//!
//! This crate provides a fixed pool of piece-sized buffers shared by every
//! open torrent, per-piece chunk coverage tracking, and the storage interface
//! a torrent engine drives while streaming.

pub mod cache;
pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use cache::{Cache, CacheError, CacheStatistics, Piece, PieceIdentity};
pub use config::{CacheConfig, EvictionMode, PiecepoolConfig};
pub use storage::{Completion, PieceStorage, TorrentStorage};
pub use torrent::{InfoHash, PieceIndex, PieceKey, TorrentLayout};

/// Errors that can bubble up from any Piecepool subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PiecePoolError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Tracing setup failed: {reason}")]
    Tracing { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PiecePoolError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            PiecePoolError::Cache(e) => match e {
                CacheError::BufferUnavailable { .. } => {
                    "Piece cache is full; release pieces or enable eviction".to_string()
                }
                CacheError::PieceTooLarge { length, slot_size } => {
                    format!("Pieces of {length} bytes do not fit in {slot_size} byte slots")
                }
                CacheError::TorrentAlreadyOpen { info_hash } => {
                    format!("Torrent {info_hash} is already open")
                }
                CacheError::InvalidConfiguration { reason } => {
                    format!("Invalid cache configuration: {reason}")
                }
                _ => "Piece cache error occurred".to_string(),
            },
            PiecePoolError::Configuration { reason } => format!("Configuration error: {reason}"),
            PiecePoolError::Tracing { .. } => "Could not set up logging".to_string(),
            PiecePoolError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PiecePoolError::Configuration { .. }
                | PiecePoolError::Cache(CacheError::InvalidConfiguration { .. })
                | PiecePoolError::Cache(CacheError::PieceTooLarge { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PiecePoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_cache_errors() {
        let error = PiecePoolError::from(CacheError::PieceTooLarge {
            length: 65536,
            slot_size: 32768,
        });

        assert_eq!(
            error.user_message(),
            "Pieces of 65536 bytes do not fit in 32768 byte slots"
        );
        assert!(error.is_user_error());
    }

    #[test]
    fn test_io_errors_are_not_user_errors() {
        let error = PiecePoolError::from(std::io::Error::other("disk gone"));

        assert_eq!(error.user_message(), "File system error occurred");
        assert!(!error.is_user_error());
    }
}
