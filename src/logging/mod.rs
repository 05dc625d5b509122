//! Logging pipeline
//!
//! Builds the console and rotating-file sinks described by a [`LogConfig`]
//! and installs them as the process-wide `tracing` dispatcher. Every sink
//! gets its own `fmt` layer with the configured template and level filter.
//!
//! The pipeline never spawns a background writer thread: it has to keep
//! working across the forks done by daemonization.

mod pattern;
mod sink;

use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{Dispatch, Level, Metadata};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, Layer, Registry};

use crate::common::config::LogConfig;
use crate::common::{Error, Result};

pub use pattern::PatternFormat;
pub use sink::{rotated_path, ConsoleSink, FlushPolicy, RotatingFileSink, Sink, SinkWriter};

/// Logger name used by the `%n` flag
pub const LOGGER_NAME: &str = "logdaemon";

/// Target of records logged at critical severity, see [`critical!`](crate::critical)
pub const CRITICAL_TARGET: &str = "logdaemon::critical";

/// Log a record at critical severity
///
/// Critical records are error-level `tracing` events with the
/// [`CRITICAL_TARGET`](crate::logging::CRITICAL_TARGET) target. They are the
/// only records written when the configured level is `critical`.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)+) => {
        ::tracing::error!(target: $crate::logging::CRITICAL_TARGET, $($arg)+)
    };
}

/// Minimum severity written by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Most severe level; only records logged with [`critical!`](crate::critical)
    Critical,
    Off,
}

impl LogLevel {
    /// Parse a level name, resolving anything unrecognized to `Info`
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Off => "off",
        }
    }

    /// Most verbose `tracing` level that can pass
    ///
    /// `Critical` shares `ERROR` with `Error`; the sink layers narrow it
    /// further to critical records.
    pub fn filter(&self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "err" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "off" => Ok(LogLevel::Off),
            other => Err(Error::Config(format!("unknown log level '{other}'"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builds a [`LogPipeline`] from a configuration snapshot
pub struct LogPipelineBuilder<'a> {
    config: &'a LogConfig,
    console: Option<Box<dyn Write + Send>>,
    name: String,
}

impl<'a> LogPipelineBuilder<'a> {
    pub fn new(config: &'a LogConfig) -> Self {
        Self {
            config,
            console: None,
            name: LOGGER_NAME.to_string(),
        }
    }

    /// Send console records to `writer` instead of stdout
    pub fn console_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.console = Some(Box::new(writer));
        self
    }

    /// Logger name rendered by `%n`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create the sinks and the subscriber
    ///
    /// Fails if the log directory or the log file cannot be created. Nothing
    /// is installed on failure.
    pub fn build(self) -> Result<LogPipeline> {
        let config = self.config;
        let path = &config.file_path;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| Error::LogDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let file = RotatingFileSink::open(path, config.max_size_bytes(), config.max_files)
            .map_err(|source| Error::LogFileOpen {
                path: path.clone(),
                source,
            })?;

        let policy = FlushPolicy {
            immediate: config.immediate_flush,
        };
        let level = config.level;
        let format = PatternFormat::new(&config.pattern, self.name);

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(2);
        let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

        if config.console_enabled {
            let (console, ansi) = match self.console {
                Some(writer) => (ConsoleSink::new(writer), false),
                None => (ConsoleSink::stdout(), io::stdout().is_terminal()),
            };
            let console: Arc<dyn Sink> = Arc::new(console);
            layers.push(sink_layer(&console, policy, format.clone(), ansi, level));
            sinks.push(console);
        }

        let file: Arc<dyn Sink> = Arc::new(file);
        layers.push(sink_layer(&file, policy, format, false, level));
        sinks.push(file);

        let subscriber = tracing_subscriber::registry().with(layers);

        Ok(LogPipeline {
            dispatch: Dispatch::new(subscriber),
            handle: LogHandle {
                sinks: Arc::new(sinks),
            },
        })
    }
}

fn sink_layer(
    sink: &Arc<dyn Sink>,
    policy: FlushPolicy,
    format: PatternFormat,
    ansi: bool,
    level: LogLevel,
) -> BoxedLayer {
    // Write failures are reported once per sink by the writer itself
    let layer = tfmt::layer()
        .event_format(format)
        .with_ansi(ansi)
        .log_internal_errors(false)
        .with_writer(SinkWriter::new(Arc::clone(sink), policy));

    match level {
        LogLevel::Critical => layer.with_filter(filter_fn(is_critical)).boxed(),
        other => layer.with_filter(other.filter()).boxed(),
    }
}

/// Whether a record was logged with [`critical!`](crate::critical)
pub fn is_critical(meta: &Metadata<'_>) -> bool {
    *meta.level() == Level::ERROR && meta.target() == CRITICAL_TARGET
}

/// A built logger, ready to be installed
pub struct LogPipeline {
    dispatch: Dispatch,
    handle: LogHandle,
}

impl LogPipeline {
    /// Make this pipeline the process-wide default for all `tracing` calls
    pub fn install(&self) -> Result<()> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())
            .map_err(|e| Error::LoggerInstall(e.to_string()))
    }

    /// Dispatcher for scoped use, e.g. `tracing::dispatcher::with_default`
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Handle for flushing and closing the sinks
    pub fn handle(&self) -> LogHandle {
        self.handle.clone()
    }
}

/// Shared handle to the pipeline's sinks
#[derive(Clone)]
pub struct LogHandle {
    sinks: Arc<Vec<Arc<dyn Sink>>>,
}

impl LogHandle {
    /// Names of the attached sinks, console first
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Flush every sink, returning the first error
    pub fn flush(&self) -> io::Result<()> {
        let mut result = Ok(());
        for sink in self.sinks.iter() {
            if let Err(e) = sink.flush() {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Flush and close every sink; records logged afterwards are dropped
    pub fn shutdown(&self) -> io::Result<()> {
        let mut result = Ok(());
        for sink in self.sinks.iter() {
            if let Err(e) = sink.close() {
                result = result.and(Err(e));
            }
        }
        result
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("sinks", &self.sink_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    /// Console writer that keeps everything in memory
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config_in(dir: &Path) -> LogConfig {
        LogConfig {
            file_path: dir.join("logs").join("test.log"),
            pattern: "[%l] %v".to_string(),
            ..LogConfig::default()
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_unknown_level_resolves_to_info() {
        for name in ["", "verbose", "fatal", "2", "notice"] {
            assert_eq!(LogLevel::parse_or_default(name), LogLevel::Info, "{name:?}");
        }
        assert_eq!(LogLevel::parse_or_default(" DEBUG "), LogLevel::Debug);
        assert_eq!(LogLevel::parse_or_default("Warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse_or_default("critical"), LogLevel::Critical);
        assert_eq!(LogLevel::Critical.filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::Off.filter(), LevelFilter::OFF);
    }

    #[test]
    fn test_file_only_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();

        assert_eq!(pipeline.handle().sink_names(), vec!["file"]);
        // The log directory is created on demand
        assert!(config.file_path.exists());

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::info!("hello");
            tracing::debug!("hidden");
        });

        assert_eq!(read(&config.file_path), "[info] hello\n");
    }

    #[test]
    fn test_console_and_file_receive_same_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            console_enabled: true,
            level: LogLevel::Warn,
            ..config_in(dir.path())
        };
        let capture = Capture::default();
        let pipeline = LogPipelineBuilder::new(&config)
            .console_writer(capture.clone())
            .build()
            .unwrap();

        assert_eq!(pipeline.handle().sink_names(), vec!["console", "file"]);

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::info!("below level");
            tracing::warn!("disk almost full");
            tracing::error!(code = 7, "write failed");
        });

        let expected = "[warning] disk almost full\n[error] write failed code=7\n";
        assert_eq!(capture.contents(), expected);
        assert_eq!(read(&config.file_path), expected);
    }

    #[test]
    fn test_buffered_records_flush_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            immediate_flush: false,
            ..config_in(dir.path())
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::info!("buffered");
        });
        assert_eq!(read(&config.file_path), "");

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::error!("flushes");
        });
        assert_eq!(read(&config.file_path), "[info] buffered\n[error] flushes\n");
    }

    #[test]
    fn test_handle_flush_writes_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            immediate_flush: false,
            ..config_in(dir.path())
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::info!("pending");
        });
        pipeline.handle().flush().unwrap();

        assert_eq!(read(&config.file_path), "[info] pending\n");
    }

    #[test]
    fn test_shutdown_stops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::info!("last");
            pipeline.handle().shutdown().unwrap();
            tracing::info!("after shutdown");
        });

        assert_eq!(read(&config.file_path), "[info] last\n");
    }

    #[test]
    fn test_critical_level_drops_plain_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            level: LogLevel::Critical,
            ..config_in(dir.path())
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::warn!("plain warning");
            tracing::error!("plain error");
            crate::critical!("disk gone");
        });

        assert_eq!(read(&config.file_path), "[critical] disk gone\n");
    }

    #[test]
    fn test_error_level_keeps_critical_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            level: LogLevel::Error,
            ..config_in(dir.path())
        };
        let pipeline = LogPipelineBuilder::new(&config).build().unwrap();

        tracing::dispatcher::with_default(pipeline.dispatch(), || {
            tracing::error!("plain error");
            crate::critical!("disk gone");
        });

        assert_eq!(
            read(&config.file_path),
            "[error] plain error\n[critical] disk gone\n"
        );
    }

    #[test]
    fn test_unusable_log_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let config = LogConfig {
            file_path: blocker.join("nested").join("test.log"),
            ..LogConfig::default()
        };
        let result = LogPipelineBuilder::new(&config).build();
        assert!(matches!(result, Err(Error::LogDirectory { .. })));
    }

    #[test]
    fn test_directory_as_log_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: dir.path().to_path_buf(),
            ..LogConfig::default()
        };
        let result = LogPipelineBuilder::new(&config).build();
        assert!(matches!(result, Err(Error::LogFileOpen { .. })));
    }
}
