use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use piecepool_core::cache::Cache;
use piecepool_core::config::{CacheConfig, EvictionMode};
use piecepool_core::storage::TorrentStorage;
use piecepool_core::torrent::{InfoHash, TorrentLayout};

const PIECE_LENGTH: u64 = 256 * 1024;
const BLOCK: usize = 16 * 1024;

fn create_bench_storage(slot_count: usize, piece_count: u64) -> (Arc<Cache>, TorrentStorage) {
    let config = CacheConfig::for_pieces(slot_count, PIECE_LENGTH as usize).with_eviction(
        EvictionMode::LeastRecentlyUsed {
            min_idle: Duration::ZERO,
        },
    );
    let cache = Arc::new(Cache::new(config).expect("valid bench config"));
    let storage = cache
        .open_torrent(
            InfoHash::new([1u8; 20]),
            TorrentLayout::new(PIECE_LENGTH, PIECE_LENGTH * piece_count),
        )
        .expect("torrent opens");
    (cache, storage)
}

fn bench_piece_write(c: &mut Criterion) {
    let (_cache, storage) = create_bench_storage(8, 8);
    let block = vec![0x5Au8; BLOCK];
    let blocks_per_piece = PIECE_LENGTH / BLOCK as u64;

    let mut group = c.benchmark_group("piece_write");
    group.throughput(Throughput::Bytes(PIECE_LENGTH));
    group.bench_function("sequential_blocks", |b| {
        b.iter(|| {
            for piece in storage.pieces() {
                for block_index in 0..blocks_per_piece {
                    piece
                        .write_at(black_box(&block), block_index * BLOCK as u64)
                        .expect("slot available");
                }
            }
        });
    });
    group.finish();
}

fn bench_piece_read(c: &mut Criterion) {
    let (_cache, storage) = create_bench_storage(4, 4);
    let content = vec![0xA5u8; PIECE_LENGTH as usize];
    for piece in storage.pieces() {
        piece.write_at(&content, 0).expect("slot available");
    }

    let mut group = c.benchmark_group("piece_read");
    for read_size in [BLOCK, 64 * 1024, PIECE_LENGTH as usize] {
        let mut buf = vec![0u8; read_size];
        group.throughput(Throughput::Bytes(read_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(read_size), &read_size, |b, _| {
            b.iter(|| {
                for piece in storage.pieces() {
                    piece.read_at(black_box(&mut buf), 0).expect("data written");
                }
            });
        });
    }
    group.finish();
}

fn bench_eviction_churn(c: &mut Criterion) {
    let (_cache, storage) = create_bench_storage(2, 16);
    let block = vec![1u8; BLOCK];

    c.bench_function("eviction_churn", |b| {
        b.iter(|| {
            for piece in storage.pieces() {
                piece.write_at(black_box(&block), 0).expect("lru frees a slot");
            }
        });
    });
}

criterion_group!(benches, bench_piece_write, bench_piece_read, bench_eviction_churn);
criterion_main!(benches);
