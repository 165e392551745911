//! Byte offset to chunk arithmetic
//!
//! Chunks are the fixed-size units used to track which parts of a piece have
//! been written. Both the write path (marking coverage) and the read path
//! (checking coverage) go through the functions in this module so they always
//! agree on chunk boundaries.

use std::ops::{Range, RangeInclusive};

/// Standard BitTorrent block size, used as the default chunk size.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// Location of a byte offset relative to chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    /// Chunk containing the offset
    pub index: u32,
    /// Distance of the offset from the start of its chunk
    pub margin: u32,
}

/// Maps a byte offset to its chunk index and margin within that chunk.
pub fn locate(offset: u64, chunk_size: u32) -> ChunkPosition {
    let chunk_size = u64::from(chunk_size);
    ChunkPosition {
        index: (offset / chunk_size) as u32,
        margin: (offset % chunk_size) as u32,
    }
}

/// Chunks touched by the byte range `[offset, offset + len)`.
///
/// A zero-length range touches the chunk containing `offset`.
pub fn covering(offset: u64, len: u64, chunk_size: u32) -> RangeInclusive<u32> {
    let first = locate(offset, chunk_size).index;
    let last = match len {
        0 => first,
        _ => locate(offset + len - 1, chunk_size).index,
    };
    first..=last
}

/// Chunks whose every byte lies inside `[offset, offset + len)`.
///
/// The end of the piece counts as a chunk boundary, so a write that reaches
/// `piece_length` also covers a short trailing chunk.
pub fn fully_covered(offset: u64, len: u64, piece_length: u64, chunk_size: u32) -> Range<u32> {
    let end = offset + len;
    let start = locate(offset, chunk_size);
    let first = match start.margin {
        0 => start.index,
        _ => start.index + 1,
    };
    let last = match end >= piece_length {
        true => chunk_count(piece_length, chunk_size),
        false => locate(end, chunk_size).index,
    };

    if first < last { first..last } else { first..first }
}

/// Part of chunk `index` written by `[offset, offset + len)`, relative to
/// the start of the chunk.
///
/// Empty when the write does not reach the chunk.
pub fn written_within(
    index: u32,
    offset: u64,
    len: u64,
    piece_length: u64,
    chunk_size: u32,
) -> Range<u32> {
    let start = u64::from(index) * u64::from(chunk_size);
    let stop = start + chunk_length(index, piece_length, chunk_size);
    let from = offset.clamp(start, stop);
    let to = offset.saturating_add(len).clamp(from, stop);
    (from - start) as u32..(to - start) as u32
}

/// Number of chunks needed to hold `piece_length` bytes.
pub fn chunk_count(piece_length: u64, chunk_size: u32) -> u32 {
    piece_length.div_ceil(u64::from(chunk_size)) as u32
}

/// Length in bytes of chunk `index` of a piece of `piece_length` bytes.
pub fn chunk_length(index: u32, piece_length: u64, chunk_size: u32) -> u64 {
    let start = u64::from(index) * u64::from(chunk_size);
    piece_length
        .saturating_sub(start)
        .min(u64::from(chunk_size))
}
