//! Configuration management for warmstore

pub mod schema;

pub use schema::{
    BootstrapConfig, CacheConfig, Config, FlushConfig, GeneralConfig, LockConfig, StorageConfig,
};

use crate::error::{StoreError, StoreResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warmstore")
            .join("config.toml")
    }

    /// Load configuration, falling back to defaults if the file does not exist.
    /// Environment overrides are applied last.
    pub async fn load(&self) -> StoreResult<Config> {
        let mut config = if fs::try_exists(&self.config_path).await.unwrap_or(false) {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Re-read the configuration file, e.g. to hot-reload cache TTLs
    pub async fn reload(&self) -> StoreResult<Config> {
        let config = self.load().await?;
        info!("Reloaded configuration from {}", self.config_path.display());
        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StoreResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| StoreError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StoreResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StoreError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StoreResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
