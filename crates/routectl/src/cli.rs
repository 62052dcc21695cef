use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// `--version` text, stamped by the build script.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("ROUTECTL_COMMIT"),
    ", built ",
    env!("ROUTECTL_BUILD_DAY"),
    " for ",
    env!("ROUTECTL_TARGET"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "routectl", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Board description (endpoints, routes, simulated hardware knobs)
    #[arg(long, short, default_value = "board.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the board description and exit
    Check,

    /// Print the initial routing status as JSON
    Status,

    /// Read commands from stdin until `quit` or EOF
    Run,

    /// Execute commands from a file, one per line
    Script {
        /// Path to the command file
        path: PathBuf,
    },
}
