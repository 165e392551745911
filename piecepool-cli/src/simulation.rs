//! Streaming playback simulation over a shared piece pool
//!
//! A peer task writes blocks in a seeded shuffled order, one window of pieces
//! at a time, and verifies pieces as they fill. A player task reads the
//! torrent front to back the way a media player would, pinning the piece under
//! the read head, asking the peer to prioritize pieces it is stuck on, and
//! releasing pieces once they are played.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use piecepool_core::cache::{Cache, CacheError, CacheStatistics};
use piecepool_core::config::CacheConfig;
use piecepool_core::storage::TorrentStorage;
use piecepool_core::torrent::{InfoHash, PieceIndex, TorrentLayout};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Misses on one block before the player asks the peer for its piece
const MISSES_BEFORE_REQUEST: u32 = 20;

/// Misses on one block before the simulation gives up
const MAX_BLOCK_MISSES: u32 = 20_000;

/// Pause between retries of a failed read or write
const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Parameters of one simulated playback.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Pieces in the simulated torrent
    pub pieces: u32,
    /// Bytes per piece
    pub piece_length: u64,
    /// Pool configuration, slot size included
    pub cache: CacheConfig,
    /// Seed for the peer's block order
    pub seed: u64,
}

/// Outcome of a simulated playback.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Pieces played back in full
    pub pieces_played: u32,
    /// Bytes read by the player
    pub bytes_played: u64,
    /// Blocks written by the peer, rewrites included
    pub blocks_written: u64,
    /// Writes retried because no slot was free
    pub write_retries: u64,
    /// Reads retried because data was missing
    pub read_retries: u64,
    /// Pieces the player asked the peer to fetch first
    pub piece_requests: u64,
    /// Wall clock time of the run in milliseconds
    pub elapsed_ms: u128,
    /// Pool counters at the end of the run
    pub statistics: CacheStatistics,
}

#[derive(Debug, Default)]
struct PeerTotals {
    blocks_written: u64,
    write_retries: u64,
}

#[derive(Debug, Default)]
struct PlayerTotals {
    pieces_played: u32,
    bytes_played: u64,
    read_retries: u64,
    piece_requests: u64,
}

/// Deterministic content byte at torrent offset `offset`
fn content_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn content_range(start: u64, len: u64) -> Vec<u8> {
    (start..start + len).map(content_byte).collect()
}

/// Builds a layout whose piece hashes match the simulated content.
fn create_layout(pieces: u32, piece_length: u64) -> TorrentLayout {
    let layout = TorrentLayout::new(piece_length, piece_length * u64::from(pieces));
    let hashes: Vec<[u8; 20]> = (0..pieces)
        .map(PieceIndex::new)
        .map(|index| {
            let content = content_range(layout.piece_offset(index), layout.piece_size(index));
            Sha1::digest(&content).into()
        })
        .collect();
    layout.with_piece_hashes(hashes)
}

/// Block start offsets within `piece`
fn piece_blocks(layout: &TorrentLayout, index: PieceIndex, block_size: u64) -> Vec<(PieceIndex, u64)> {
    (0..layout.piece_size(index))
        .step_by(block_size as usize)
        .map(|offset| (index, offset))
        .collect()
}

/// Peer download order: windows of `window` pieces, shuffled within each window.
fn create_schedule(
    layout: &TorrentLayout,
    window: u32,
    block_size: u64,
    seed: u64,
) -> VecDeque<(PieceIndex, u64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut schedule = VecDeque::new();

    let piece_count = layout.piece_count();
    let mut start = 0;
    while start < piece_count {
        let end = (start + window.max(1)).min(piece_count);
        let mut blocks: Vec<_> = (start..end)
            .map(PieceIndex::new)
            .flat_map(|index| piece_blocks(layout, index, block_size))
            .collect();
        blocks.shuffle(&mut rng);
        schedule.extend(blocks);
        start = end;
    }

    schedule
}

/// Runs one simulated playback to completion.
///
/// # Errors
///
/// - If the pool configuration is invalid or pieces do not fit a slot
/// - If playback stalls or returns bytes that were never written
pub async fn run_simulation(options: SimulationOptions) -> anyhow::Result<SimulationReport> {
    let started = Instant::now();
    let cache = Arc::new(Cache::new(options.cache.clone()).context("Failed to build piece pool")?);
    let layout = create_layout(options.pieces, options.piece_length);
    let info_hash = InfoHash::new(Sha1::digest(options.seed.to_be_bytes()).into());
    let storage = Arc::new(
        cache
            .open_torrent(info_hash, layout)
            .context("Failed to open simulated torrent")?,
    );

    info!(
        "Simulating {} pieces of {} bytes over {} slots (eviction {}, seed {})",
        options.pieces,
        options.piece_length,
        options.cache.slot_count,
        options.cache.eviction,
        options.seed
    );

    let playhead = Arc::new(AtomicU32::new(0));
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let block_size = u64::from(options.cache.chunk_size);
    let schedule = create_schedule(
        storage.layout(),
        options.cache.slot_count as u32,
        block_size,
        options.seed,
    );

    let peer = tokio::spawn(run_peer(
        Arc::clone(&storage),
        Arc::clone(&playhead),
        schedule,
        block_size,
        request_rx,
    ));
    let player = tokio::spawn(run_player(
        Arc::clone(&cache),
        Arc::clone(&storage),
        playhead,
        block_size,
        request_tx,
    ));

    let player_totals = player.await.context("Player task failed")??;
    let peer_totals = peer.await.context("Peer task failed")??;

    let report = SimulationReport {
        pieces_played: player_totals.pieces_played,
        bytes_played: player_totals.bytes_played,
        blocks_written: peer_totals.blocks_written,
        write_retries: peer_totals.write_retries,
        read_retries: player_totals.read_retries,
        piece_requests: player_totals.piece_requests,
        elapsed_ms: started.elapsed().as_millis(),
        statistics: cache.statistics(),
    };

    if let Ok(storage) = Arc::try_unwrap(storage) {
        storage.close();
    }

    Ok(report)
}

async fn run_peer(
    storage: Arc<TorrentStorage>,
    playhead: Arc<AtomicU32>,
    mut schedule: VecDeque<(PieceIndex, u64)>,
    block_size: u64,
    mut requests: mpsc::UnboundedReceiver<PieceIndex>,
) -> anyhow::Result<PeerTotals> {
    let mut totals = PeerTotals::default();

    loop {
        while let Ok(index) = requests.try_recv() {
            prioritize_piece(&storage, &mut schedule, index, block_size);
        }

        let Some((index, offset)) = schedule.pop_front() else {
            match requests.recv().await {
                Some(index) => {
                    prioritize_piece(&storage, &mut schedule, index, block_size);
                    continue;
                }
                None => break,
            }
        };

        if index.as_u32() < playhead.load(Ordering::Acquire) {
            continue;
        }
        let Some(piece) = storage.piece(index) else {
            bail!("Scheduled piece {index} is outside the torrent");
        };
        if piece.completion().complete {
            continue;
        }

        let len = block_size.min(piece.length() - offset);
        let data = content_range(storage.layout().piece_offset(index) + offset, len);
        loop {
            match piece.write_at(&data, offset) {
                Ok(_) => break,
                Err(CacheError::BufferUnavailable { .. }) => {
                    totals.write_retries += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                    if index.as_u32() < playhead.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(error) => return Err(error).context("Peer write failed"),
            }
        }
        totals.blocks_written += 1;

        let (covered, total) = piece.chunk_progress();
        if covered == total && piece.is_active() {
            match piece.verify()? {
                true => {
                    piece.mark_complete();
                    debug!("Peer completed piece {}", index);
                }
                false => {
                    warn!("Piece {} failed verification, refetching", index);
                    piece.release();
                    schedule.extend(piece_blocks(storage.layout(), index, block_size));
                }
            }
        }

        tokio::task::yield_now().await;
    }

    debug!(
        "Peer finished: {} blocks written, {} write retries",
        totals.blocks_written, totals.write_retries
    );
    Ok(totals)
}

/// Moves every block of `index` to the front of the schedule
fn prioritize_piece(
    storage: &TorrentStorage,
    schedule: &mut VecDeque<(PieceIndex, u64)>,
    index: PieceIndex,
    block_size: u64,
) {
    let Some(piece) = storage.piece(index) else {
        return;
    };
    if piece.completion().complete {
        return;
    }

    schedule.retain(|(scheduled, _)| *scheduled != index);
    for block in piece_blocks(storage.layout(), index, block_size).into_iter().rev() {
        schedule.push_front(block);
    }
    debug!("Peer prioritized piece {}", index);
}

/// Asks the peer for `index` again, returning false once the peer has exited
fn request_piece(requests: &mpsc::UnboundedSender<PieceIndex>, index: PieceIndex) -> bool {
    match requests.send(index) {
        Ok(()) => true,
        Err(error) => {
            debug!("Peer gone, dropped request for piece {}", error.0);
            false
        }
    }
}

async fn run_player(
    cache: Arc<Cache>,
    storage: Arc<TorrentStorage>,
    playhead: Arc<AtomicU32>,
    block_size: u64,
    requests: mpsc::UnboundedSender<PieceIndex>,
) -> anyhow::Result<PlayerTotals> {
    let mut totals = PlayerTotals::default();
    let mut buf = vec![0u8; block_size as usize];

    for piece in storage.pieces() {
        let index = piece.index();
        let piece_start = storage.layout().piece_offset(index);
        cache.pin(piece.key());

        for offset in (0..piece.length()).step_by(block_size as usize) {
            let len = block_size.min(piece.length() - offset) as usize;
            let block = &mut buf[..len];
            let mut misses = 0;

            loop {
                match piece.read_at(block, offset) {
                    Ok(_) => break,
                    Err(error) if error.is_retryable() => {
                        misses += 1;
                        totals.read_retries += 1;
                        if misses % MISSES_BEFORE_REQUEST == 0 {
                            if request_piece(&requests, index) {
                                totals.piece_requests += 1;
                            }
                        }
                        if misses >= MAX_BLOCK_MISSES {
                            cache.unpin(piece.key());
                            bail!("Playback stalled on piece {index} at offset {offset}");
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(error) => {
                        cache.unpin(piece.key());
                        return Err(error).context("Player read failed");
                    }
                }
            }

            if block.iter().zip(piece_start + offset..).any(|(&b, at)| b != content_byte(at)) {
                cache.unpin(piece.key());
                bail!("Piece {index} returned wrong bytes at offset {offset}");
            }
            totals.bytes_played += len as u64;
        }

        let mut waits = 0;
        while !piece.completion().complete {
            waits += 1;
            if waits >= MAX_BLOCK_MISSES {
                cache.unpin(piece.key());
                bail!("Piece {index} was never marked complete");
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }

        playhead.store(index.as_u32() + 1, Ordering::Release);
        cache.unpin(piece.key());
        piece.release();
        totals.pieces_played += 1;
        debug!("Player finished piece {}", index);
    }

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use piecepool_core::config::EvictionMode;

    use super::*;

    fn create_test_options(slots: usize, eviction: EvictionMode) -> SimulationOptions {
        SimulationOptions {
            pieces: 12,
            piece_length: 32768,
            cache: CacheConfig::for_pieces(slots, 32768).with_eviction(eviction),
            seed: 7,
        }
    }

    #[test]
    fn test_schedule_is_seeded_and_windowed() {
        let layout = TorrentLayout::new(32768, 32768 * 4);

        let first = create_schedule(&layout, 2, 16384, 9);
        let second = create_schedule(&layout, 2, 16384, 9);

        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        assert!(first.iter().take(4).all(|(index, _)| index.as_u32() < 2));
    }

    #[test]
    fn test_layout_hashes_match_content() {
        let layout = create_layout(3, 1000);
        let expected: [u8; 20] = Sha1::digest(content_range(1000, 1000)).into();

        assert_eq!(layout.piece_hash(PieceIndex::new(1)), Some(expected));
    }

    #[test]
    fn test_request_piece_reports_departed_peer() {
        let (requests, mut receiver) = mpsc::unbounded_channel();

        assert!(request_piece(&requests, PieceIndex::new(3)));
        assert_eq!(receiver.try_recv().ok(), Some(PieceIndex::new(3)));

        drop(receiver);
        assert!(!request_piece(&requests, PieceIndex::new(4)));
    }

    #[tokio::test]
    async fn test_simulation_without_eviction_plays_everything() {
        let report = run_simulation(create_test_options(2, EvictionMode::Disabled))
            .await
            .unwrap();

        assert_eq!(report.pieces_played, 12);
        assert_eq!(report.bytes_played, 12 * 32768);
        assert_eq!(report.statistics.evictions, 0);
        assert_eq!(report.statistics.occupied_slots, 0);
    }

    #[tokio::test]
    async fn test_simulation_with_lru_plays_everything() {
        let eviction = EvictionMode::LeastRecentlyUsed {
            min_idle: Duration::ZERO,
        };
        let report = run_simulation(create_test_options(3, eviction)).await.unwrap();

        assert_eq!(report.pieces_played, 12);
        assert!(report.blocks_written >= 24);
    }
}
