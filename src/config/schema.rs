//! Configuration schema for warmstore
//!
//! Configuration is stored at `~/.config/warmstore/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// In-memory cache settings
    pub cache: CacheConfig,

    /// Write-back flusher settings
    pub flush: FlushConfig,

    /// Durable storage settings
    pub storage: StorageConfig,

    /// Startup preload settings
    pub bootstrap: BootstrapConfig,

    /// Entity lock settings
    pub lock: LockConfig,
}

impl Config {
    /// Apply `WARMSTORE_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_u64("WARMSTORE_CACHE_TTL_SECS") {
            self.cache.default_ttl_secs = secs;
        }
        if let Some(secs) = env_u64("WARMSTORE_FLUSH_INTERVAL_SECS") {
            self.flush.interval_secs = secs;
        }
        if let Ok(root) = std::env::var("WARMSTORE_STORAGE_ROOT") {
            if !root.is_empty() {
                self.storage.root = PathBuf::from(root);
            }
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not an unsigned integer", name, raw);
            None
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Default tracing filter directive
    pub log_filter: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            log_filter: "warmstore=info".to_string(),
        }
    }
}

/// Cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL applied by plain `set` (0 = entries never expire)
    pub default_ttl_secs: u64,

    /// How often expired entries are swept (0 = disabled)
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 0,
            sweep_interval_secs: 60,
        }
    }
}

/// Write-back flusher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Run the periodic flusher
    pub enabled: bool,

    /// Seconds between flush passes
    pub interval_secs: u64,
}

impl FlushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

/// Durable storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the filesystem backend
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
        }
    }
}

/// Startup preload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Preload entities at startup
    pub enabled: bool,

    /// Backend path whose children are entity ids
    pub entities_root: String,

    /// Maximum entities loaded concurrently
    pub concurrency: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entities_root: "events".to_string(),
            concurrency: 8,
        }
    }
}

/// Entity lock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Give up waiting for an entity lock after N seconds (0 = wait forever)
    pub acquire_timeout_secs: u64,
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_secs > 0).then(|| Duration::from_secs(self.acquire_timeout_secs))
    }
}
