//! Configuration, log and session paths

use std::path::PathBuf;

/// Name used for the project directories
const PROJECT_NAME: &str = "metabox";

/// Directory where checkbox persists its sessions on a machine
pub const CHECKBOX_SESSIONS_DIR: &str = "/var/tmp/checkbox-ng/sessions";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/metabox/`
/// - macOS: `~/Library/Application Support/metabox/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", PROJECT_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", PROJECT_NAME)
        .map(|dirs| dirs.data_dir().join("logs"))
}

/// Default root searched for persisted checkbox sessions
pub fn sessions_dir() -> PathBuf {
    PathBuf::from(CHECKBOX_SESSIONS_DIR)
}
