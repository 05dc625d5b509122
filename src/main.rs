//! logdaemon - a background service with a configurable logging pipeline
//!
//! Loads its configuration, sets up console and rotating-file logging,
//! optionally detaches from the terminal, and heartbeats until SIGINT or
//! SIGTERM asks it to stop.

use std::path::PathBuf;

use clap::Parser;
use logdaemon::{cli, commands};
use commands::{Commands, RunArgs};

#[derive(Parser)]
#[command(name = "logdaemon", about = "Background service with rotating file logging")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (YAML, or TOML by extension)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn main() {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Run(RunArgs::default()));

    if let Err(e) = cli::dispatch(cli.config.as_deref(), command) {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
