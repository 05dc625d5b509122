//! Error types for the service daemon
//!
//! Setup-phase errors are fatal and carry the exit status the process
//! terminates with. Configuration errors are only fatal for `check-config`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status for a failed logging initialization (sysexits `EX_CANTCREAT`)
pub const EXIT_LOGGING: i32 = 73;

/// Exit status for a failed OS-level operation (sysexits `EX_OSERR`)
pub const EXIT_OS: i32 = 71;

/// Exit status for an unusable configuration (sysexits `EX_CONFIG`)
pub const EXIT_CONFIG: i32 = 78;

/// Main error type for the service daemon
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Failed to read config file '{path}': {error}")]
    ConfigRead { path: String, error: String },

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // === Logging Errors ===
    #[error("Failed to create log directory '{}': {source}", .path.display())]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open log file '{}': {source}", .path.display())]
    LogFileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to install logger: {0}")]
    LoggerInstall(String),

    // === Process Errors ===
    #[error("Failed to register signal handlers: {0}")]
    SignalRegistration(#[source] io::Error),

    #[error("Daemonization failed while trying to {step}: {source}")]
    Daemonize {
        step: DaemonStep,
        #[source]
        source: io::Error,
    },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The daemonization step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStep {
    RecordWorkingDir,
    FirstFork,
    NewSession,
    SecondFork,
    RestoreWorkingDir,
    RedirectStreams,
    ReinstallSignals,
}

impl fmt::Display for DaemonStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            DaemonStep::RecordWorkingDir => "record the working directory",
            DaemonStep::FirstFork => "fork the first child",
            DaemonStep::NewSession => "start a new session",
            DaemonStep::SecondFork => "fork the second child",
            DaemonStep::RestoreWorkingDir => "restore the working directory",
            DaemonStep::RedirectStreams => "redirect standard streams",
            DaemonStep::ReinstallSignals => "re-register signal handlers",
        };
        f.write_str(step)
    }
}

impl Error {
    /// Create a daemonization error for the given step
    pub fn daemonize(step: DaemonStep, source: io::Error) -> Self {
        Self::Daemonize { step, source }
    }

    /// Create a config read error
    pub fn config_read(path: &std::path::Path, error: &io::Error) -> Self {
        Self::ConfigRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Process exit status for this error when it aborts startup
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::LogDirectory { .. } | Error::LogFileOpen { .. } | Error::LoggerInstall(_) => {
                EXIT_LOGGING
            }
            Error::SignalRegistration(_) | Error::Daemonize { .. } => EXIT_OS,
            Error::ConfigRead { .. } | Error::ConfigParse(_) | Error::Config(_) => EXIT_CONFIG,
            Error::Io(_) => 1,
        }
    }
}
