//! Multi-threaded access to a shared pool.
//!
//! Many threads write, read and release their own pieces against a pool much
//! smaller than the torrent. Reads must either return exactly the bytes the
//! owning thread wrote or fail with a retryable error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use piecepool_core::cache::{Cache, CacheError};
use piecepool_core::config::{CacheConfig, EvictionMode};
use piecepool_core::torrent::{InfoHash, TorrentLayout};

const PIECE_LENGTH: u64 = 32768;
const CHUNK: usize = 16384;
const THREADS: u32 = 8;
const PIECES_PER_THREAD: u32 = 4;
const ROUNDS: usize = 50;

fn piece_fill(index: u32, round: usize) -> u8 {
    (index as usize * 31 + round) as u8
}

fn create_test_cache(slot_count: usize, eviction: EvictionMode) -> Arc<Cache> {
    let config = CacheConfig::for_pieces(slot_count, PIECE_LENGTH as usize).with_eviction(eviction);
    Arc::new(Cache::new(config).unwrap())
}

#[test]
fn test_concurrent_readers_never_see_foreign_data() {
    let cache = create_test_cache(
        4,
        EvictionMode::LeastRecentlyUsed {
            min_idle: Duration::ZERO,
        },
    );
    let piece_count = THREADS * PIECES_PER_THREAD;
    let storage = Arc::new(
        cache
            .open_torrent(
                InfoHash::new([5u8; 20]),
                TorrentLayout::new(PIECE_LENGTH, PIECE_LENGTH * u64::from(piece_count)),
            )
            .unwrap(),
    );
    let overflow = Arc::new(AtomicBool::new(false));

    thread::scope(|scope| {
        let monitor_cache = Arc::clone(&cache);
        let monitor_overflow = Arc::clone(&overflow);
        let done = Arc::new(AtomicBool::new(false));
        let monitor_done = Arc::clone(&done);
        let monitor = scope.spawn(move || {
            while !monitor_done.load(Ordering::Relaxed) {
                if monitor_cache.occupied_slots() > 4 {
                    monitor_overflow.store(true, Ordering::Relaxed);
                }
                thread::yield_now();
            }
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|worker| {
                let storage = Arc::clone(&storage);
                scope.spawn(move || {
                    let mut buf = vec![0u8; PIECE_LENGTH as usize];
                    for round in 0..ROUNDS {
                        for slot in 0..PIECES_PER_THREAD {
                            let index = worker * PIECES_PER_THREAD + slot;
                            let piece = &storage.pieces()[index as usize];
                            let fill = piece_fill(index, round);

                            for chunk in 0..2u64 {
                                match piece.write_at(&[fill; CHUNK], chunk * CHUNK as u64) {
                                    Ok(written) => assert_eq!(written, CHUNK),
                                    Err(error) => assert!(error.is_retryable(), "{error}"),
                                }
                            }

                            match piece.read_at(&mut buf, 0) {
                                Ok(read) => {
                                    assert_eq!(read, buf.len());
                                    assert!(
                                        buf.iter().all(|&b| b == fill),
                                        "piece {index} returned foreign bytes"
                                    );
                                }
                                Err(CacheError::IncompleteData { .. }) => {}
                                Err(error) => panic!("unexpected read error: {error}"),
                            }

                            if round % 3 == 0 {
                                piece.release();
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        monitor.join().unwrap();
    });

    assert!(!overflow.load(Ordering::Relaxed), "pool exceeded its slot count");
    let stats = cache.statistics();
    assert!(stats.occupied_slots <= 4);
    assert!(stats.evictions > 0);
    assert!(stats.read_hits > 0);
}

#[test]
fn test_contended_pool_without_eviction_keeps_capacity() {
    let cache = create_test_cache(2, EvictionMode::Disabled);
    let storage = Arc::new(
        cache
            .open_torrent(
                InfoHash::new([6u8; 20]),
                TorrentLayout::new(PIECE_LENGTH, PIECE_LENGTH * 16),
            )
            .unwrap(),
    );

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let storage = Arc::clone(&storage);
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let index = (worker as usize + round) % storage.pieces().len();
                    let piece = &storage.pieces()[index];
                    match piece.write_at(&[1u8; CHUNK], 0) {
                        Ok(_) => piece.release(),
                        Err(CacheError::BufferUnavailable { .. }) => {}
                        Err(error) => panic!("unexpected write error: {error}"),
                    }
                }
            });
        }
    });

    let stats = cache.statistics();
    assert_eq!(stats.occupied_slots, 0);
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.claims, stats.releases);
}
