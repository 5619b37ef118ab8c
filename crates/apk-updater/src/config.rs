//! Configuration for the update pipeline.
//!
//! The release endpoint and trusted host list are compile-time constants (see
//! [`crate::origin`]); only network tuning and local storage are configurable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main updater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Network configuration for the release check and downloads
    #[serde(default)]
    pub network: NetworkConfig,

    /// Download staging configuration
    #[serde(default)]
    pub download: DownloadConfig,
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would disable the bounded fetch timeout.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.network.connect_timeout_secs == 0 || self.network.read_timeout_secs == 0 {
            return Err(UpdateError::ConfigError(
                "network timeouts must be greater than zero".to_string(),
            ));
        }
        if self.download.poll_interval_ms == 0 {
            return Err(UpdateError::ConfigError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Maximum transfer attempts for a single download
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

/// Download staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory downloads are written to (empty = default location)
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Interval between status polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Title shown on the download notification
    #[serde(default = "default_notification_title")]
    pub notification_title: String,

    /// File persisting the download-id to path map (empty = in memory only)
    #[serde(default)]
    pub store_file: Option<PathBuf>,
}

impl DownloadConfig {
    /// Get the download directory, using default if not specified.
    pub fn download_dir(&self) -> PathBuf {
        match &self.download_dir {
            Some(dir) => dir.clone(),
            None => default_download_dir(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            poll_interval_ms: default_poll_interval(),
            notification_title: default_notification_title(),
            store_file: None,
        }
    }
}

// Default value functions for serde
fn default_connect_timeout() -> u64 {
    15
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_user_agent() -> String {
    format!("apk-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_poll_interval() -> u64 {
    500
}

fn default_notification_title() -> String {
    "Downloading update".to_string()
}

/// Platform-appropriate cache location for downloaded updates.
fn default_download_dir() -> PathBuf {
    if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(cache_home).join("apk-updater").join("downloads");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".cache")
            .join("apk-updater")
            .join("downloads");
    }

    // Fallback
    PathBuf::from(".").join("downloads")
}
