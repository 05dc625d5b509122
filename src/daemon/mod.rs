//! Daemon mode - detaching from the terminal and running the service
//!
//! [`DaemonSupervisor`] performs the classic double fork:
//!
//! ```text
//! FOREGROUND -> FORK1 -> SESSION_LEADER -> FORK2 -> DETACHED
//! ```
//!
//! Every step is a commit point. A failure is returned as
//! [`Error::Daemonize`] and the caller terminates the process.

pub mod service;
pub mod signals;

use std::path::PathBuf;

use crate::common::config::DaemonConfig;
use crate::common::{Error, Result};
use crate::logging::LogHandle;

#[cfg(unix)]
use crate::common::error::DaemonStep;

pub use service::{LoopSummary, Pause, ServiceLoop, ThreadSleep};
pub use signals::{ShutdownFlag, ShutdownSignal, SignalBridge};

/// Position in the daemonization sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Foreground,
    /// Child of the first fork
    Fork1,
    /// Child of the first fork after `setsid`
    SessionLeader,
    /// Child of the second fork, not yet fully set up
    Fork2,
    Detached,
}

/// Process identity after the supervisor ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonOutcome {
    pub state: DaemonState,
    /// Pid of the process that started the transition
    pub original_pid: u32,
    /// Pid of the surviving process
    pub pid: u32,
    /// Working directory recorded before detaching and restored afterwards
    pub working_dir: Option<PathBuf>,
}

/// Turns the foreground process into a daemon when configured to
pub struct DaemonSupervisor {
    config: DaemonConfig,
    state: DaemonState,
}

impl DaemonSupervisor {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            state: DaemonState::Foreground,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Detach if daemon mode is enabled; otherwise stay in the foreground
    ///
    /// Only the final daemon process returns from this call. The logger is
    /// reused as-is: its file descriptors stay valid across the forks and
    /// the stream redirection.
    pub fn run(&mut self, log: &LogHandle, signals: &mut SignalBridge) -> Result<DaemonOutcome> {
        let original_pid = std::process::id();

        if !self.config.daemon_mode {
            tracing::info!("daemon mode not configured, staying in the foreground");
            return Ok(DaemonOutcome {
                state: self.state,
                original_pid,
                pid: original_pid,
                working_dir: None,
            });
        }

        self.detach(log, signals)
    }

    #[cfg(unix)]
    fn detach(&mut self, log: &LogHandle, signals: &mut SignalBridge) -> Result<DaemonOutcome> {
        let original_pid = std::process::id();
        let working_dir = std::env::current_dir()
            .map_err(|e| Error::daemonize(DaemonStep::RecordWorkingDir, e))?;

        tracing::info!("daemon mode configured, detaching from the terminal");

        fork_and_exit_parent(log, DaemonStep::FirstFork)?;
        self.transition(DaemonState::Fork1);

        // SAFETY: setsid takes no arguments and only changes process attributes
        if unsafe { libc::setsid() } < 0 {
            return Err(Error::daemonize(
                DaemonStep::NewSession,
                std::io::Error::last_os_error(),
            ));
        }
        self.transition(DaemonState::SessionLeader);

        fork_and_exit_parent(log, DaemonStep::SecondFork)?;
        self.transition(DaemonState::Fork2);

        // SAFETY: umask cannot fail
        unsafe { libc::umask(0) };

        std::env::set_current_dir(&working_dir)
            .map_err(|e| Error::daemonize(DaemonStep::RestoreWorkingDir, e))?;

        if !self.config.keep_console_streams {
            redirect_std_streams().map_err(|e| Error::daemonize(DaemonStep::RedirectStreams, e))?;
        }

        signals
            .reinstall()
            .map_err(|e| Error::daemonize(DaemonStep::ReinstallSignals, e))?;
        self.transition(DaemonState::Detached);

        let pid = std::process::id();
        tracing::info!("running as a daemon (pid: {pid})");

        Ok(DaemonOutcome {
            state: self.state,
            original_pid,
            pid,
            working_dir: Some(working_dir),
        })
    }

    #[cfg(not(unix))]
    fn detach(&mut self, _log: &LogHandle, _signals: &mut SignalBridge) -> Result<DaemonOutcome> {
        tracing::warn!("daemon mode is not supported on this platform, staying in the foreground");
        let pid = std::process::id();
        Ok(DaemonOutcome {
            state: self.state,
            original_pid: pid,
            pid,
            working_dir: None,
        })
    }

    fn transition(&mut self, next: DaemonState) {
        tracing::debug!(from = ?self.state, to = ?next, "daemon state transition");
        self.state = next;
    }
}

/// Fork; the parent exits immediately with success and the child returns
#[cfg(unix)]
fn fork_and_exit_parent(log: &LogHandle, step: DaemonStep) -> Result<()> {
    flush_before_fork(log);

    // SAFETY: the process is single-threaded here, so the child does not
    // inherit locks held by other threads
    match unsafe { libc::fork() } {
        -1 => Err(Error::daemonize(step, std::io::Error::last_os_error())),
        0 => Ok(()),
        // SAFETY: _exit skips atexit handlers and destructors, leaving the
        // shared descriptors to the child
        _ => unsafe { libc::_exit(libc::EXIT_SUCCESS) },
    }
}

/// Flush buffered records so they are not written by both processes
///
/// A failure goes to stderr: a log record would itself sit in the buffer
/// being forked.
#[cfg(unix)]
fn flush_before_fork(log: &LogHandle) -> bool {
    match log.flush() {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Warning: failed to flush logs before fork: {e}");
            false
        }
    }
}

/// Point stdin, stdout and stderr at `/dev/null`
#[cfg(unix)]
fn redirect_std_streams() -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open for the duration of the call
        if unsafe { libc::dup2(null.as_raw_fd(), target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::LogConfig;
    use crate::logging::LogPipelineBuilder;
    use std::io::{self, Write};

    /// Console writer whose flush always fails
    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_flush_before_fork_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: dir.path().join("svc.log"),
            console_enabled: true,
            ..LogConfig::default()
        };
        let healthy = LogPipelineBuilder::new(&LogConfig {
            console_enabled: false,
            ..config.clone()
        })
        .build()
        .unwrap();
        assert!(flush_before_fork(&healthy.handle()));

        let broken = LogPipelineBuilder::new(&config)
            .console_writer(BrokenPipe)
            .build()
            .unwrap();
        assert!(!flush_before_fork(&broken.handle()));
    }

    #[test]
    fn test_foreground_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: dir.path().join("svc.log"),
            pattern: "%v".to_string(),
            ..LogConfig::default()
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();
        let flag = ShutdownFlag::new();
        let mut signals = SignalBridge::with_signals(&flag, &[]).unwrap();
        let mut supervisor = DaemonSupervisor::new(DaemonConfig::default());

        let outcome = tracing::dispatcher::with_default(pipeline.dispatch(), || {
            supervisor.run(&pipeline.handle(), &mut signals).unwrap()
        });

        assert_eq!(outcome.state, DaemonState::Foreground);
        assert_eq!(outcome.pid, std::process::id());
        assert_eq!(outcome.pid, outcome.original_pid);
        assert_eq!(outcome.working_dir, None);
        assert_eq!(supervisor.state(), DaemonState::Foreground);

        let log = std::fs::read_to_string(&config.file_path).unwrap();
        assert_eq!(log, "daemon mode not configured, staying in the foreground\n");
    }
}
