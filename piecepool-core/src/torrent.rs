//! Torrent identity types shared by the cache and its callers

use std::fmt;
use std::str::FromStr;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to keep pieces of different torrents apart inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Error returned when parsing an info hash from hex fails.
#[derive(Debug, thiserror::Error)]
#[error("Invalid info hash '{input}': expected 40 hex characters")]
pub struct InfoHashParseError {
    /// The rejected input
    pub input: String,
}

impl FromStr for InfoHash {
    type Err = InfoHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(s, &mut hash).map_err(|_| InfoHashParseError {
            input: s.to_string(),
        })?;
        Ok(Self(hash))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one piece of one torrent.
///
/// Unique per (torrent, piece index) pair, which is all the pool needs to
/// tell slot occupants apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceKey {
    /// Torrent the piece belongs to
    pub info_hash: InfoHash,
    /// Position of the piece within the torrent
    pub index: PieceIndex,
}

impl PieceKey {
    /// Creates a key for `index` within the torrent `info_hash`.
    pub fn new(info_hash: InfoHash, index: PieceIndex) -> Self {
        Self { info_hash, index }
    }
}

impl fmt::Display for PieceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.info_hash, self.index)
    }
}

/// Piece geometry of a torrent.
///
/// Every piece is `piece_length` bytes except the last one, which holds
/// whatever remains of `total_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    /// Nominal length of each piece in bytes
    pub piece_length: u64,
    /// Total content length in bytes
    pub total_length: u64,
    /// Expected SHA-1 per piece, empty when unknown
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TorrentLayout {
    /// Creates a layout without piece hashes.
    pub fn new(piece_length: u64, total_length: u64) -> Self {
        Self {
            piece_length,
            total_length,
            piece_hashes: Vec::new(),
        }
    }

    /// Attaches expected piece hashes to the layout.
    pub fn with_piece_hashes(mut self, piece_hashes: Vec<[u8; 20]>) -> Self {
        self.piece_hashes = piece_hashes;
        self
    }

    /// Number of pieces needed to hold `total_length` bytes.
    pub fn piece_count(&self) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(self.piece_length) as u32
    }

    /// Length of the piece at `index`, or zero past the last piece.
    pub fn piece_size(&self, index: PieceIndex) -> u64 {
        let start = u64::from(index.as_u32()) * self.piece_length;
        self.total_length
            .saturating_sub(start)
            .min(self.piece_length)
    }

    /// Expected hash of the piece at `index`, if known.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<[u8; 20]> {
        self.piece_hashes.get(index.as_u32() as usize).copied()
    }

    /// Byte offset of the piece at `index` within the torrent.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * self.piece_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_hex_round_trip() {
        let info_hash = InfoHash::new([0xab; 20]);
        let text = info_hash.to_string();

        assert_eq!(text.len(), 40);
        assert_eq!(text.parse::<InfoHash>().unwrap(), info_hash);
        assert!("not-a-hash".parse::<InfoHash>().is_err());
    }

    #[test]
    fn test_piece_key_display() {
        let key = PieceKey::new(InfoHash::new([0u8; 20]), PieceIndex::new(7));
        assert!(key.to_string().ends_with(":7"));
    }

    #[test]
    fn test_layout_last_piece_is_short() {
        let layout = TorrentLayout::new(32768, 100_000);

        assert_eq!(layout.piece_count(), 4);
        assert_eq!(layout.piece_size(PieceIndex::new(0)), 32768);
        assert_eq!(layout.piece_size(PieceIndex::new(3)), 100_000 - 3 * 32768);
        assert_eq!(layout.piece_size(PieceIndex::new(4)), 0);
        assert_eq!(layout.piece_offset(PieceIndex::new(2)), 65536);
    }

    #[test]
    fn test_layout_piece_hash_lookup() {
        let layout = TorrentLayout::new(16, 32).with_piece_hashes(vec![[1u8; 20]]);

        assert_eq!(layout.piece_hash(PieceIndex::new(0)), Some([1u8; 20]));
        assert_eq!(layout.piece_hash(PieceIndex::new(1)), None);
    }
}
