//! Configuration file handling
//!
//! The configuration is a flat key/value document in YAML or TOML. Every key
//! is read on its own: a missing or malformed value falls back to its default
//! and leaves a warning behind instead of failing the whole load.

use serde::{de::IgnoredAny, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths;
use super::{Error, Result};
use crate::logging::LogLevel;

/// Default log line template (spdlog syntax)
pub const DEFAULT_PATTERN: &str = "[%Y-%m-%d %H:%M:%S.%e] [%l] %v";

/// Default rotation threshold in KiB
pub const DEFAULT_MAX_SIZE_KIB: u64 = 10;

/// Default number of rotated files kept next to the active one
pub const DEFAULT_MAX_FILES: usize = 3;

/// Default pause between heartbeats
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// Logging settings
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Mirror records to stdout
    pub console_enabled: bool,
    /// Minimum severity written to any sink
    pub level: LogLevel,
    /// Line template applied to every sink
    pub pattern: String,
    /// Active log file; rotated siblings live next to it
    pub file_path: PathBuf,
    /// Flush every record instead of only error records
    pub immediate_flush: bool,
    /// Rotate once the active file would grow past this many KiB
    pub max_size_kib: u64,
    /// Rotated files to retain (always at least one)
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: false,
            level: LogLevel::Info,
            pattern: DEFAULT_PATTERN.to_string(),
            file_path: paths::default_log_file(),
            immediate_flush: true,
            max_size_kib: DEFAULT_MAX_SIZE_KIB,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl LogConfig {
    /// Rotation threshold in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_kib.saturating_mul(1024)
    }
}

/// Daemonization settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DaemonConfig {
    /// Detach from the controlling terminal at startup
    pub daemon_mode: bool,
    /// Leave stdin/stdout/stderr attached after detaching
    pub keep_console_streams: bool,
}

/// Full configuration snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub log: LogConfig,
    pub daemon: DaemonConfig,
    /// Pause between heartbeats in the service loop
    pub heartbeat_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            daemon: DaemonConfig::default(),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

/// Result of loading a configuration file
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServiceConfig,
    /// File the values came from, `None` when only defaults were used
    pub source: Option<PathBuf>,
    /// Keys that were present but unusable
    pub warnings: Vec<String>,
}

impl ServiceConfig {
    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Load configuration from an explicit path, or from the first existing
    /// default location
    ///
    /// Returns default configuration if no default file exists. An explicit
    /// path that cannot be read is an error.
    pub fn discover(explicit: Option<&Path>) -> Result<LoadedConfig> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match paths::config_candidates().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::load(&path),
            None => Ok(LoadedConfig {
                config: Self::default(),
                source: None,
                warnings: Vec::new(),
            }),
        }
    }

    /// Load configuration from a YAML or TOML file
    pub fn load(path: &Path) -> Result<LoadedConfig> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::config_read(path, &e))?;
        let format = ConfigFormat::from_path(path);
        let (config, warnings) = Self::parse(&content, format)?;

        Ok(LoadedConfig {
            config,
            source: Some(path.to_path_buf()),
            warnings,
        })
    }

    /// Parse configuration text, returning the config and per-key warnings
    pub fn parse(content: &str, format: ConfigFormat) -> Result<(Self, Vec<String>)> {
        let values: BTreeMap<String, RawValue> = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            match format {
                ConfigFormat::Yaml => serde_yaml::from_str(content)
                    .map_err(|e| Error::ConfigParse(e.to_string()))?,
                ConfigFormat::Toml => {
                    toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?
                }
            }
        };

        let mut raw = RawConfig {
            values,
            warnings: Vec::new(),
        };
        let config = Self::from_raw(&mut raw);
        Ok((config, raw.warnings))
    }

    fn from_raw(raw: &mut RawConfig) -> Self {
        let defaults = Self::default();

        let console_enabled = raw.bool_or("log_console", defaults.log.console_enabled);
        let level = match raw.text("level") {
            Some(text) => LogLevel::parse_or_default(&text),
            None => defaults.log.level,
        };
        let pattern = raw
            .text("pattern")
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.log.pattern);
        let file_path = raw
            .text("filename")
            .filter(|f| !f.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.log.file_path);
        let immediate_flush = raw.bool_or("immediate_flush", defaults.log.immediate_flush);
        let max_size_kib = raw.positive_or("max_size", defaults.log.max_size_kib);
        let max_files = raw.positive_or("max_files", defaults.log.max_files as u64) as usize;

        let daemon_mode = if raw.contains("daemonMode") {
            raw.bool_or("daemonMode", defaults.daemon.daemon_mode)
        } else {
            raw.bool_or("daemon_mode", defaults.daemon.daemon_mode)
        };
        let heartbeat_secs = raw.positive_or("heartbeat_secs", defaults.heartbeat_secs);

        Self {
            log: LogConfig {
                console_enabled,
                level,
                pattern,
                file_path,
                immediate_flush,
                max_size_kib,
                max_files,
            },
            daemon: DaemonConfig {
                daemon_mode,
                keep_console_streams: console_enabled,
            },
            heartbeat_secs,
        }
    }

    /// Render the effective configuration using the file's key names
    pub fn to_yaml(&self) -> Result<String> {
        let view = ConfigView {
            log_console: self.log.console_enabled,
            level: self.log.level.as_str(),
            pattern: &self.log.pattern,
            filename: self.log.file_path.display().to_string(),
            immediate_flush: self.log.immediate_flush,
            max_size: self.log.max_size_kib,
            max_files: self.log.max_files,
            daemon_mode: self.daemon.daemon_mode,
            heartbeat_secs: self.heartbeat_secs,
        };
        serde_yaml::to_string(&view).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Supported configuration file syntaxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick the syntax from the file extension; anything but `.toml` is YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// A single configuration value before it is interpreted
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

struct RawConfig {
    values: BTreeMap<String, RawValue>,
    warnings: Vec<String>,
}

impl RawConfig {
    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn warn(&mut self, key: &str, expected: &str, fallback: impl std::fmt::Display) {
        self.warnings.push(format!(
            "'{key}' is not a valid {expected}, using default {fallback}"
        ));
    }

    fn bool_or(&mut self, key: &str, default: bool) -> bool {
        let parsed = match self.values.get(key) {
            None => return default,
            Some(RawValue::Bool(b)) => Some(*b),
            Some(RawValue::Int(i)) if *i == 0 || *i == 1 => Some(*i == 1),
            Some(RawValue::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            Some(_) => None,
        };
        parsed.unwrap_or_else(|| {
            self.warn(key, "boolean", default);
            default
        })
    }

    fn positive_or(&mut self, key: &str, default: u64) -> u64 {
        let parsed = match self.values.get(key) {
            None => return default,
            Some(RawValue::Int(i)) => u64::try_from(*i).ok(),
            Some(RawValue::Text(s)) => s.trim().parse::<u64>().ok(),
            Some(_) => None,
        };
        match parsed {
            Some(v) if v > 0 => v,
            _ => {
                self.warn(key, "positive integer", default);
                default
            }
        }
    }

    fn text(&mut self, key: &str) -> Option<String> {
        match self.values.get(key) {
            None => None,
            Some(RawValue::Text(s)) => Some(s.clone()),
            Some(RawValue::Bool(b)) => Some(b.to_string()),
            Some(RawValue::Int(i)) => Some(i.to_string()),
            Some(RawValue::Float(f)) => Some(f.to_string()),
            Some(RawValue::Other(_)) => {
                self.warnings
                    .push(format!("'{key}' is not a valid string, using default"));
                None
            }
        }
    }
}

#[derive(Serialize)]
struct ConfigView<'a> {
    log_console: bool,
    level: &'a str,
    pattern: &'a str,
    filename: String,
    immediate_flush: bool,
    max_size: u64,
    max_files: usize,
    #[serde(rename = "daemonMode")]
    daemon_mode: bool,
    heartbeat_secs: u64,
}
