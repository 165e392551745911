//! CLI command implementations

use anyhow::Context;
use clap::Subcommand;
use piecepool_core::config::{CacheConfig, EvictionMode, PiecepoolConfig};
use tracing::info;

use crate::simulation::{SimulationOptions, SimulationReport, run_simulation};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a simulated torrent through a bounded piece pool
    Simulate {
        /// Number of pieces in the torrent
        #[arg(long, default_value = "64")]
        pieces: u32,
        /// Bytes per piece
        #[arg(long, default_value = "262144")]
        piece_length: u64,
        /// Slots in the pool
        #[arg(long, default_value = "4")]
        slots: usize,
        /// Eviction mode when the pool is full (disabled, lru)
        #[arg(long)]
        eviction: Option<EvictionMode>,
        /// Seed for the peer's block order
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
}

/// Handle the CLI command
///
/// # Errors
///
/// - If the simulation fails or its report cannot be serialized
pub async fn handle_command(command: Commands, config: PiecepoolConfig) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            pieces,
            piece_length,
            slots,
            eviction,
            seed,
            json,
        } => {
            let cache = simulation_cache(&config.cache, slots, piece_length, eviction)?;
            let options = SimulationOptions {
                pieces,
                piece_length,
                cache,
                seed,
            };
            let report = run_simulation(options).await?;
            print_report(&report, json)
        }
        Commands::Config => {
            show_config(&config);
            Ok(())
        }
    }
}

/// Pool configuration for a simulation: one slot per piece length, chunk size
/// and eviction taken from the environment unless overridden.
fn simulation_cache(
    base: &CacheConfig,
    slots: usize,
    piece_length: u64,
    eviction: Option<EvictionMode>,
) -> anyhow::Result<CacheConfig> {
    let slot_size = usize::try_from(piece_length).context("Piece length does not fit in memory")?;
    let cache = CacheConfig {
        slot_count: slots,
        slot_size,
        chunk_size: base.chunk_size,
        eviction: eviction.unwrap_or(base.eviction),
    };
    cache.validate()?;
    Ok(cache)
}

fn print_report(report: &SimulationReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let stats = &report.statistics;
    println!("Simulation Report");
    println!("{:-<60}", "");
    println!("Pieces played: {}", report.pieces_played);
    println!(
        "Bytes played: {:.2} MB",
        report.bytes_played as f64 / 1_048_576.0
    );
    println!(
        "Blocks written: {} ({} write retries)",
        report.blocks_written, report.write_retries
    );
    println!(
        "Read retries: {} ({} piece requests)",
        report.read_retries, report.piece_requests
    );
    println!("Elapsed: {} ms", report.elapsed_ms);
    println!();
    println!("Pool");
    println!("{:-<60}", "");
    println!("Slots: {}", stats.slot_count);
    println!("Claims: {} ({} failed)", stats.claims, stats.claim_failures);
    println!("Evictions: {}", stats.evictions);
    println!("Releases: {}", stats.releases);
    println!(
        "Read hit rate: {:.1}% ({} hits, {} misses)",
        stats.hit_rate * 100.0,
        stats.read_hits,
        stats.read_misses
    );

    info!(
        "Simulation finished: {} pieces in {} ms",
        report.pieces_played, report.elapsed_ms
    );
    Ok(())
}

fn show_config(config: &PiecepoolConfig) {
    let cache = &config.cache;
    println!("Piecepool Configuration");
    println!("{:-<60}", "");
    println!("Slot count: {}", cache.slot_count);
    println!("Slot size: {} bytes", cache.slot_size);
    println!("Chunk size: {} bytes", cache.chunk_size);
    println!("Eviction: {}", cache.eviction);
    if let EvictionMode::LeastRecentlyUsed { min_idle } = cache.eviction {
        println!("Eviction min idle: {} ms", min_idle.as_millis());
    }
    println!(
        "Memory budget: {:.2} MB",
        cache.memory_budget() as f64 / 1_048_576.0
    );
    println!("Logs directory: {}", config.logging.logs_dir.display());
}
