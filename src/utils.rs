//! Utility functions for locating configuration
//!
//! # Directory Structure
//!
//! - User config: `~/.config/originwall/allowlist.json` (XDG)
//! - System config: `/etc/originwall/allowlist.json`

use directories::ProjectDirs;
use std::path::PathBuf;

/// File name of the allowlist document in every search location
pub const ALLOWLIST_FILE: &str = "allowlist.json";

/// System-wide config directory, checked after the XDG one
pub const SYSTEM_CONFIG_DIR: &str = "/etc/originwall";

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "originwall", "originwall").map(|pd| pd.config_dir().to_path_buf())
}

/// Candidate allowlist files, most specific first
pub fn allowlist_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if let Some(dir) = get_config_dir() {
        paths.push(dir.join(ALLOWLIST_FILE));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG_DIR).join(ALLOWLIST_FILE));
    paths
}
