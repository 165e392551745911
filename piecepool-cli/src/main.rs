//! Piecepool CLI - Command-line interface
//!
//! Runs streaming simulations against the piece pool and shows the
//! configuration the environment produces.

mod commands;
mod simulation;

use clap::Parser;
use piecepool_core::config::PiecepoolConfig;
use piecepool_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "piecepool")]
#[command(about = "Bounded in-memory piece cache for streaming BitTorrent")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PiecepoolConfig::from_env();

    init_tracing(cli.log_level.as_tracing_level(), Some(&config.logging.logs_dir))?;

    commands::handle_command(cli.command, config).await
}
