//! routectl: drive the audio route coordinator from the command line.
//!
//! Loads a TOML board description, builds the routing context on a simulated
//! device layer and accepts commands (`start`, `stop`, `route`, `device`,
//! `ready`, `release`, `status`, ...) from stdin or a script file. Hardware
//! notifications are delivered from their own thread, the way a real device
//! layer would report them.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use routectl::{cli, config, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_route=info,routectl=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = cli::VERSION, "routectl starting");
    let board = config::BoardConfig::load(&args.config)?;
    tracing::info!(
        config = ?args.config,
        endpoints = board.endpoints.len(),
        routes = board.routes.len(),
        "board loaded"
    );

    match &args.cmd {
        cli::Command::Check => runtime::run_check(&board),
        cli::Command::Status => runtime::run_status(&board),
        cli::Command::Run => {
            runtime::require_endpoints(&board)?;
            runtime::run_interactive(&board)
        }
        cli::Command::Script { path } => {
            runtime::require_endpoints(&board)?;
            runtime::run_script(&board, path)
        }
    }
}
