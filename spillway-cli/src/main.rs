//! Spillway CLI - Command-line interface
//!
//! Provides command-line access to Spillway functionality.

mod commands;

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "spillway")]
#[command(about = "A live stream capture relay for TV-tuner backends")]
struct Cli {
    /// Path to the operator configuration file
    #[arg(short, long, default_value = "spillway.json")]
    config: PathBuf,

    /// Console log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    spillway_core::tracing_setup::init_tracing(cli.log_level, None)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command, &cli.config).await
}
