//! Coverage bitmap of written chunks within a piece

use std::collections::BTreeMap;
use std::ops::{Range, RangeInclusive};

/// Bitmap recording which chunks of a piece hold fully written data
///
/// Chunks reached only by partial writes keep a sorted list of disjoint
/// written spans until the spans join up to cover the whole chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMap {
    bits: Vec<u8>,
    chunk_count: u32,
    covered: u32,
    partial: BTreeMap<u32, Vec<Range<u32>>>,
}

impl ChunkMap {
    /// Create an empty bitmap for `chunk_count` chunks
    pub fn new(chunk_count: u32) -> Self {
        let byte_count = chunk_count.div_ceil(8); // Round up to nearest byte
        Self {
            bits: vec![0u8; byte_count as usize],
            chunk_count,
            covered: 0,
            partial: BTreeMap::new(),
        }
    }

    /// Check if chunk has been covered by a write
    pub fn contains(&self, chunk: u32) -> bool {
        if chunk >= self.chunk_count {
            return false;
        }

        let byte_index = (chunk / 8) as usize;
        let bit_index = 7 - (chunk % 8); // MSB first

        (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Mark chunk as covered, returning whether it was newly set
    ///
    /// Indices past the end of the piece are ignored.
    pub fn insert(&mut self, chunk: u32) -> bool {
        if chunk >= self.chunk_count || self.contains(chunk) {
            return false;
        }

        let byte_index = (chunk / 8) as usize;
        let bit_index = 7 - (chunk % 8);

        self.bits[byte_index] |= 1 << bit_index;
        self.covered += 1;
        true
    }

    /// Record bytes `written` of a chunk `chunk_length` bytes long
    ///
    /// `written` is relative to the start of the chunk. Returns whether the
    /// chunk became covered by this call.
    pub fn record(&mut self, chunk: u32, written: Range<u32>, chunk_length: u32) -> bool {
        if chunk >= self.chunk_count || written.is_empty() || self.contains(chunk) {
            return false;
        }

        let spans = self.partial.entry(chunk).or_default();
        spans.push(written);
        spans.sort_by_key(|span| span.start);

        let mut merged: Vec<Range<u32>> = Vec::with_capacity(spans.len());
        for span in spans.drain(..) {
            match merged.last_mut() {
                Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
                _ => merged.push(span),
            }
        }

        if !matches!(merged.as_slice(), [only] if only.start == 0 && only.end >= chunk_length) {
            *spans = merged;
            return false;
        }

        self.partial.remove(&chunk);
        self.insert(chunk)
    }

    /// Bytes written so far into a chunk that is not yet covered
    pub fn partial_bytes(&self, chunk: u32) -> u32 {
        self.partial
            .get(&chunk)
            .map(|spans| spans.iter().map(|span| span.end - span.start).sum())
            .unwrap_or(0)
    }

    /// Forget all coverage
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.covered = 0;
        self.partial.clear();
    }

    /// Number of covered chunks
    pub fn covered_count(&self) -> u32 {
        self.covered
    }

    /// Total number of chunks tracked
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Whether every chunk of the piece is covered
    pub fn is_full(&self) -> bool {
        self.chunk_count > 0 && self.covered == self.chunk_count
    }

    /// Whether no chunk is covered
    pub fn is_empty(&self) -> bool {
        self.covered == 0
    }

    /// First chunk in `chunks` that is not covered
    pub fn first_missing(&self, chunks: RangeInclusive<u32>) -> Option<u32> {
        chunks.into_iter().find(|&chunk| !self.contains(chunk))
    }
}
