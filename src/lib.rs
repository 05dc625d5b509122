//! logdaemon - a background service with a configurable logging pipeline
//!
//! The library exposes the pieces the binary wires together: the logging
//! pipeline builder, the signal bridge, the daemon supervisor and the
//! service loop.

pub mod cli;
pub mod commands;
pub mod common;
pub mod daemon;
pub mod logging;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use daemon::{DaemonSupervisor, ServiceLoop, ShutdownFlag, SignalBridge};
pub use logging::{LogLevel, LogPipelineBuilder};
