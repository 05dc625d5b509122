//! CLI command handling
//!
//! Runs the service setup in order: configuration, logging, signals,
//! daemonization, then the service loop.

use std::path::Path;

use crate::commands::{Commands, RunArgs};
use crate::common::config::{LoadedConfig, ServiceConfig};
use crate::common::{Error, Result};
use crate::daemon::{DaemonSupervisor, ServiceLoop, ShutdownFlag, SignalBridge};
use crate::logging::{LogHandle, LogPipelineBuilder};

/// Dispatch a CLI command
pub fn dispatch(config_path: Option<&Path>, command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run_service(config_path, &args),

        Commands::ShowConfig(args) => {
            let mut config = load_or_default(config_path);
            args.apply(&mut config);
            print!("{}", config.to_yaml()?);
            Ok(())
        }

        Commands::CheckConfig => {
            let loaded = ServiceConfig::discover(config_path)?;
            match &loaded.source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No config file found, using defaults"),
            }
            for warning in &loaded.warnings {
                println!("  {warning}");
            }
            if loaded.warnings.is_empty() {
                println!("Configuration OK");
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "{} unusable value(s)",
                    loaded.warnings.len()
                )))
            }
        }
    }
}

/// Load the configuration, substituting defaults when it cannot be read
///
/// Logging is not up yet, so problems go to stderr.
fn load_or_default(config_path: Option<&Path>) -> ServiceConfig {
    match ServiceConfig::discover(config_path) {
        Ok(LoadedConfig {
            config, warnings, ..
        }) => {
            for warning in warnings {
                eprintln!("Warning: {warning}");
            }
            config
        }
        Err(e) => {
            eprintln!("Warning: {e}, using default configuration");
            ServiceConfig::default()
        }
    }
}

fn run_service(config_path: Option<&Path>, args: &RunArgs) -> Result<()> {
    let mut config = load_or_default(config_path);
    args.apply(&mut config);

    let pipeline = LogPipelineBuilder::new(&config.log).build()?;
    pipeline.install()?;
    let log = pipeline.handle();

    serve(&config, &log).inspect_err(|e| {
        tracing::error!("{e}");
        let _ = log.shutdown();
    })
}

fn serve(config: &ServiceConfig, log: &LogHandle) -> Result<()> {
    let flag = ShutdownFlag::new();
    let mut signals = SignalBridge::install(&flag)?;
    tracing::info!("signal handlers registered (SIGINT, SIGTERM)");

    let outcome = DaemonSupervisor::new(config.daemon).run(log, &mut signals)?;

    let cwd = std::env::current_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    tracing::info!(
        "initialization complete, pid: {}, working directory: {}",
        outcome.pid,
        cwd
    );

    // Closes the logging pipeline on the way out
    ServiceLoop::new(config.heartbeat_interval()).run(&flag, &mut signals, log);
    Ok(())
}
