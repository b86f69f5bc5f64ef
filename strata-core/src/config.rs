//! Configuration management.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent configuration for the strata daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root data directory. Snapshots, record metadata, and local source
    /// contexts live under here.
    pub root_dir: String,
    /// Unix socket the daemon listens on.
    pub socket_path: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root().to_string_lossy().to_string(),
            socket_path: "/tmp/strata.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Default root data directory: `~/.strata`.
pub fn default_root() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/var/lib")).join(".strata")
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        default_root().join("config.json")
    }

    /// Load configuration from disk, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StrataError::InvalidConfig {
            reason: format!("failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| StrataError::InvalidConfig {
            reason: format!("failed to parse config: {}", e),
        })
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrataError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|e| StrataError::Io { path, source: e })
    }
}
