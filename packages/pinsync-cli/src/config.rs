// Controller configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::sync::EngineSettings;

pub const HOME_ENV: &str = "PINSYNC_HOME";

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Directory holding the metadata database
    pub root: PathBuf,

    /// Backends synced concurrently by one request
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,

    /// Backends probed concurrently by a health sweep
    #[serde(default = "default_health_concurrency")]
    pub health_concurrency: usize,

    /// Deadline for each adapter call, in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_sync_concurrency() -> usize {
    4
}

fn default_health_concurrency() -> usize {
    8
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl ControllerConfig {
    /// Load configuration with the following priority:
    /// 1. PINSYNC_HOME environment variable (root only)
    /// 2. config.toml file
    /// 3. Default: data dir / pinsync
    pub async fn load() -> Result<Self> {
        if let Ok(home) = std::env::var(HOME_ENV) {
            return Ok(Self::with_root(home));
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::load_from(&config_path).await;
            }
        }

        Ok(Self::default())
    }

    /// Read a config file
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Defaults rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Get the config file path (~/.config/pinsync/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pinsync").join("config.toml"))
    }

    /// Save configuration to the default config file
    pub async fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_file_path().context("Failed to determine config directory")?;
        self.save_to(&config_path).await?;
        Ok(config_path)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the metadata database path
    pub fn db_path(&self) -> PathBuf {
        self.root.join("pinsync.db")
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            concurrency: self.sync_concurrency.max(1),
            call_timeout: self.call_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pinsync");

        Self {
            root,
            sync_concurrency: default_sync_concurrency(),
            health_concurrency: default_health_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}
