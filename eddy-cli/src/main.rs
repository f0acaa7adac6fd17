//! Eddy CLI - Command-line interface
//!
//! Runs the streaming server, downloads headlessly and inspects torrents.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use eddy_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "eddy")]
#[command(about = "Stream torrents while they download")]
struct Cli {
    /// Console log level; RUST_LOG overrides it
    #[arg(long, global = true, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full-trace log file
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command).await
}
