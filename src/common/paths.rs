//! Configuration and log file locations
//!
//! Relative paths resolve against the working directory the service was
//! started from. Daemonization restores that directory, so they keep
//! resolving after the process detaches.

use std::path::PathBuf;

/// Name used for the config file and the platform config directory
const APP_NAME: &str = "logdaemon";

/// Default active log file, relative to the working directory
pub fn default_log_file() -> PathBuf {
    PathBuf::from("logs").join(format!("{APP_NAME}.log"))
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/logdaemon/`
/// - macOS: `~/Library/Application Support/logdaemon/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Config files tried in order when no `--config` is given
///
/// `./config/` first, then `../config/` for a binary started from a build
/// directory, then the platform config directory.
pub fn config_candidates() -> Vec<PathBuf> {
    let file_name = format!("{APP_NAME}.yaml");
    let mut candidates = vec![
        PathBuf::from("config").join(&file_name),
        PathBuf::from("..").join("config").join(&file_name),
    ];
    if let Some(dir) = config_dir() {
        candidates.push(dir.join(&file_name));
        candidates.push(dir.join(format!("{APP_NAME}.toml")));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_file_is_under_logs() {
        let path = default_log_file();
        assert!(path.starts_with("logs"));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("log"));
    }

    #[test]
    fn test_local_config_is_tried_first() {
        let candidates = config_candidates();
        assert_eq!(candidates[0], PathBuf::from("config/logdaemon.yaml"));
        assert!(candidates.len() >= 2);
    }
}
