//! Configuration and log paths
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/dutctl/` and `~/.local/share/dutctl/`
//! - macOS: `~/Library/Application Support/dutctl/`

use std::path::PathBuf;

/// Name used for the config and data directories
const APP_NAME: &str = "dutctl";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_toml() {
        if let Some(path) = config_path() {
            assert_eq!(path.file_name().unwrap(), "config.toml");
        }
    }
}
