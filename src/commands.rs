//! CLI command definitions
//!
//! Defines the clap commands for the service binary.

use clap::{Args, Subcommand};

use crate::common::config::ServiceConfig;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service (the default when no command is given)
    Run(RunArgs),

    /// Print the effective configuration as YAML
    ShowConfig(RunArgs),

    /// Load the configuration strictly and report unusable values
    CheckConfig,
}

/// Overrides applied on top of the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Detach from the terminal regardless of `daemonMode`
    #[arg(long, conflicts_with = "foreground")]
    pub daemon: bool,

    /// Stay in the foreground regardless of `daemonMode`
    #[arg(long)]
    pub foreground: bool,

    /// Seconds between heartbeats
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat: Option<u64>,
}

impl RunArgs {
    /// Apply the overrides to a loaded configuration
    pub fn apply(&self, config: &mut ServiceConfig) {
        if self.daemon {
            config.daemon.daemon_mode = true;
        }
        if self.foreground {
            config.daemon.daemon_mode = false;
        }
        if let Some(secs) = self.heartbeat {
            config.heartbeat_secs = secs;
        }
    }
}
