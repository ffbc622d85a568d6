//! Persistent settings.
//!
//! Settings are stored as JSON in the platform config directory
//! (`~/.config/sorapc/settings.json` on Linux). Every field has a default so
//! older files keep loading. Secrets are never stored here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::account::Account;
use crate::outgoing::SmtpConfig;
use crate::{Error, Result};

/// Application directory name under the platform config/data dirs.
const APP_DIR: &str = "sorapc";

/// Retry behaviour for transient network failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_backoff_ms: u64,
    /// Upper bound for any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 250,
            max_backoff_ms: 8_000,
        }
    }
}

/// Image cache budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Decoded bytes kept in memory.
    pub memory_budget_bytes: u64,
    /// Encoded bytes kept on disk.
    pub disk_budget_bytes: u64,
    /// Disk cache directory; defaults to the platform cache dir.
    pub disk_dir: Option<PathBuf>,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 64 * 1024 * 1024,
            disk_budget_bytes: 256 * 1024 * 1024,
            disk_dir: None,
        }
    }
}

impl ImageCacheConfig {
    /// Directory used for the disk cache.
    #[must_use]
    pub fn resolved_disk_dir(&self) -> PathBuf {
        self.disk_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("images")
        })
    }
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Default number of messages per page.
    pub page_size: u64,
    /// Age after which cached data is considered stale.
    pub staleness_secs: u64,
    /// Interval of background sync runs.
    pub interval_secs: u64,
    /// Write attempts for a conflicting document before giving up for this run.
    pub max_conflict_attempts: u32,
    /// Transient error retry policy.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            staleness_secs: 60,
            interval_secs: 300,
            max_conflict_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Staleness threshold as a duration.
    #[must_use]
    pub const fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    /// Background interval as a duration.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Everything persisted in `settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Signed-in account, if any.
    pub account: Option<Account>,
    /// Sync engine tuning.
    pub sync: SyncConfig,
    /// Image cache budgets.
    pub images: ImageCacheConfig,
    /// Outgoing mail server; mail stays queued while unset.
    pub smtp: Option<SmtpConfig>,
    /// Cache database path; defaults to the platform data dir.
    pub database_path: Option<PathBuf>,
}

impl Settings {
    /// Default location of the settings file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("settings.json")
    }

    /// Cache database location.
    #[must_use]
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("sorapc.db")
        })
    }

    /// Load settings, falling back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save settings, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Config(format!("no parent directory for {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        info!("Settings saved to {:?}", path);
        Ok(())
    }
}
