//! Service loop - heartbeat until shutdown is requested

use std::time::Duration;

use super::signals::{ShutdownFlag, ShutdownSignal};
use crate::logging::LogHandle;

/// Suspension between heartbeats
pub trait Pause {
    /// Suspend for up to `interval`; returning early is allowed
    fn pause(&mut self, interval: Duration);
}

/// Plain sleep, for callers without a signal bridge
pub struct ThreadSleep;

impl Pause for ThreadSleep {
    fn pause(&mut self, interval: Duration) {
        std::thread::sleep(interval);
    }
}

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    /// Heartbeats emitted before shutdown was observed
    pub heartbeats: u64,
    pub signal: ShutdownSignal,
}

/// The steady-state body of the service
///
/// The flag is checked once per iteration, so shutdown is observed within
/// one heartbeat interval at most. A record write that hangs delays shutdown
/// for as long as it hangs.
pub struct ServiceLoop {
    interval: Duration,
}

impl ServiceLoop {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run until `flag` is set, then flush and close the logging pipeline
    pub fn run<P: Pause + ?Sized>(
        &self,
        flag: &ShutdownFlag,
        pause: &mut P,
        log: &LogHandle,
    ) -> LoopSummary {
        let mut heartbeats = 0u64;

        let signal = loop {
            if let Some(signal) = flag.signal() {
                tracing::warn!("received {signal}, shutting down");
                break signal;
            }

            tracing::info!("service running");
            heartbeats += 1;
            pause.pause(self.interval);
        };

        if let Err(e) = log.flush() {
            eprintln!("Warning: failed to flush logs: {e}");
        }
        tracing::info!("exiting");
        if let Err(e) = log.shutdown() {
            eprintln!("Warning: failed to close logs: {e}");
        }

        LoopSummary { heartbeats, signal }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::LogConfig;
    use crate::logging::{rotated_path, LogPipelineBuilder};
    use std::path::Path;

    /// Pause that requests shutdown after a fixed number of heartbeats
    struct StopAfter {
        remaining: u64,
        flag: ShutdownFlag,
        paused: Vec<Duration>,
    }

    impl StopAfter {
        fn new(heartbeats: u64, flag: &ShutdownFlag) -> Self {
            Self {
                remaining: heartbeats,
                flag: flag.clone(),
                paused: Vec::new(),
            }
        }
    }

    impl Pause for StopAfter {
        fn pause(&mut self, interval: Duration) {
            self.paused.push(interval);
            self.remaining -= 1;
            if self.remaining == 0 {
                self.flag.request();
            }
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_flag_already_set_skips_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: dir.path().join("svc.log"),
            pattern: "%v".to_string(),
            ..LogConfig::default()
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();
        let flag = ShutdownFlag::new();
        flag.request();

        let summary = tracing::dispatcher::with_default(pipeline.dispatch(), || {
            ServiceLoop::new(Duration::from_secs(1)).run(&flag, &mut ThreadSleep, &pipeline.handle())
        });

        assert_eq!(summary.heartbeats, 0);
        assert_eq!(summary.signal, ShutdownSignal::Requested);
        assert_eq!(
            lines(&config.file_path),
            vec!["received shutdown request, shutting down", "exiting"]
        );
    }

    #[test]
    fn test_exiting_is_the_final_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: dir.path().join("svc.log"),
            pattern: "[%l] %v".to_string(),
            immediate_flush: false,
            ..LogConfig::default()
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();
        let flag = ShutdownFlag::new();
        let mut pause = StopAfter::new(3, &flag);

        let summary = tracing::dispatcher::with_default(pipeline.dispatch(), || {
            let summary = ServiceLoop::new(Duration::from_millis(250)).run(
                &flag,
                &mut pause,
                &pipeline.handle(),
            );
            tracing::info!("after the loop");
            summary
        });

        assert_eq!(summary.heartbeats, 3);
        assert_eq!(pause.paused, vec![Duration::from_millis(250); 3]);
        let lines = lines(&config.file_path);
        assert_eq!(lines.len(), 5);
        assert!(lines[..3].iter().all(|l| l == "[info] service running"));
        assert_eq!(lines[3], "[warning] received shutdown request, shutting down");
        assert_eq!(lines[4], "[info] exiting");
    }

    #[test]
    fn test_heartbeats_rotate_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: dir.path().join("logs").join("svc.log"),
            max_size_kib: 10,
            max_files: 3,
            console_enabled: false,
            ..LogConfig::default()
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();
        assert_eq!(pipeline.handle().sink_names(), vec!["file"]);

        let flag = ShutdownFlag::new();
        // ~50 bytes per heartbeat, comfortably more than 4 files of 10 KiB
        let mut pause = StopAfter::new(2000, &flag);
        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            ServiceLoop::new(Duration::ZERO).run(&flag, &mut pause, &pipeline.handle())
        });

        let files = std::fs::read_dir(dir.path().join("logs")).unwrap().count();
        assert_eq!(files, 4);
        for index in 0..=3 {
            assert!(rotated_path(&config.file_path, index).exists(), "slot {index}");
        }
        assert!(!rotated_path(&config.file_path, 4).exists());

        let last = lines(&config.file_path).pop().unwrap();
        assert!(last.ends_with("[info] exiting"), "{last}");
    }
}
