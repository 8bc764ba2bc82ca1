//! Entity cache facade
//!
//! [`EntityCache`] is what request handlers hold. It serves every read from
//! the [`CacheStore`], loads lazily from the backend on a miss, and offers the
//! two write modes:
//!
//! | Mode          | Call               | Disk updated             |
//! |---------------|--------------------|--------------------------|
//! | Write-through | `set_with_persist` | before the call returns  |
//! | Write-back    | `set_dirty`        | on the next flush pass   |
//!
//! Read-modify-write sequences must run under [`EntityCache::lock`]:
//!
//! ```ignore
//! let _guard = cache.lock("E1").await?;
//! let mut config = cache.get_or_load(&CONFIG, "E1").await?;
//! config["count"] = json!(config["count"].as_u64().unwrap_or(0) + 1);
//! cache.set_dirty(CONFIG.key("E1"), config, CONFIG, "E1")?;
//! ```

use crate::backend::{FsBackend, PersistenceBackend};
use crate::bootstrap::{BootstrapLoader, BootstrapPlan, BootstrapReport};
use crate::config::{CacheConfig, Config, ConfigManager};
use crate::dirty::{DirtyRecord, DirtyTracker};
use crate::error::StoreResult;
use crate::flusher::{FlushReport, FlushStats, Flusher};
use crate::lock::{EntityLockGuard, EntityLockManager, LockStats};
use crate::record::{RecordKind, RecordRegistry};
use crate::store::{CacheStats, CacheStore};
use crate::worker::WorkerHandle;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Cache-as-source-of-truth over a persistence backend
pub struct EntityCache {
    store: Arc<CacheStore>,
    backend: Arc<dyn PersistenceBackend>,
    records: Arc<RecordRegistry>,
    locks: EntityLockManager,
    flusher: Arc<Flusher>,
    loader: BootstrapLoader,
    config: Config,
    workers: AsyncMutex<Vec<WorkerHandle>>,
}

impl EntityCache {
    /// Create a cache over `backend` with layouts from `records`
    pub fn new(backend: Arc<dyn PersistenceBackend>, records: RecordRegistry, config: &Config) -> Self {
        let records = Arc::new(records);
        let store = Arc::new(CacheStore::new(
            Arc::new(DirtyTracker::new()),
            config.cache.default_ttl(),
        ));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::clone(&records),
        ));
        let loader = BootstrapLoader::new(Arc::clone(&store), Arc::clone(&backend), Arc::clone(&records));

        Self {
            store,
            backend,
            records,
            locks: EntityLockManager::new(),
            flusher,
            loader,
            config: config.clone(),
            workers: AsyncMutex::new(Vec::new()),
        }
    }

    /// Create a cache over the filesystem backend at `config.storage.root`
    pub fn open(records: RecordRegistry, config: &Config) -> Self {
        let backend = Arc::new(FsBackend::new(config.storage.root.clone()));
        info!("Opening entity cache at {}", config.storage.root.display());
        Self::new(backend, records, config)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    pub fn records(&self) -> &RecordRegistry {
        &self.records
    }

    pub fn locks(&self) -> &EntityLockManager {
        &self.locks
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        self.store.get_as(key)
    }

    /// Cache-only write; neither persisted nor marked dirty
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.store.set(key, value);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.store.set_with_ttl(key, value, ttl);
    }

    pub fn set_typed<T: Serialize>(&self, key: impl Into<String>, value: &T) -> StoreResult<()> {
        self.store.set_typed(key, value)
    }

    /// Remove a key; a pending write-back for it is discarded too
    pub fn delete(&self, key: &str) -> usize {
        self.store.delete(key)
    }

    pub fn invalidate(&self, pattern: &str) -> StoreResult<usize> {
        self.store.invalidate(pattern)
    }

    pub fn list_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.store.list_keys(pattern)
    }

    /// Record that `key` must be persisted as `kind` of `entity_id` on the next flush
    pub fn mark_dirty(
        &self,
        key: impl Into<String>,
        kind: impl Into<RecordKind>,
        entity_id: impl Into<String>,
    ) -> StoreResult<()> {
        let kind = kind.into();
        self.records.layout(&kind)?;
        self.store
            .dirty()
            .mark(DirtyRecord::new(key, kind, entity_id));
        Ok(())
    }

    /// Write-back: update the cache now, persist on the next flush pass
    pub fn set_dirty(
        &self,
        key: impl Into<String>,
        value: Value,
        kind: impl Into<RecordKind>,
        entity_id: impl Into<String>,
    ) -> StoreResult<()> {
        let kind = kind.into();
        // Reject values the layout cannot encode now rather than at flush time
        self.records.layout(&kind)?.encode(&value)?;

        let key = key.into();
        self.store.set(key.clone(), value);
        self.store
            .dirty()
            .mark(DirtyRecord::new(key, kind, entity_id));
        Ok(())
    }

    /// Write-through: update the cache, then persist before returning.
    ///
    /// On a persistence error the cache keeps the new value; the caller
    /// decides whether to roll it back or retry.
    pub async fn set_with_persist(
        &self,
        key: impl Into<String>,
        value: Value,
        kind: impl Into<RecordKind>,
        entity_id: impl Into<String>,
    ) -> StoreResult<()> {
        let kind = kind.into();
        let entity_id = entity_id.into();
        let layout = self.records.layout(&kind)?;
        let path = layout.path(&entity_id);
        let bytes = layout.encode(&value)?;

        let _paused = self.flusher.pause().await;
        let key = key.into();
        self.store.set(key.clone(), value);
        self.backend.write_raw(&path, &bytes).await?;
        self.store.dirty().remove(&key);

        debug!("Persisted {} to {}", key, path);
        Ok(())
    }

    /// Read a record from the backend and cache it if the key is absent.
    ///
    /// A value cached in the meantime (a write-back or a write-through that
    /// finished during the read) is newer than the disk copy, so it is kept
    /// and returned instead.
    pub async fn load(&self, kind: &RecordKind, entity_id: &str) -> StoreResult<Value> {
        self.loader.load_record(kind, entity_id).await
    }

    /// Cached record, loaded from the backend on a miss.
    ///
    /// A record the backend does not have comes back as
    /// [`StoreError::NotFound`](crate::StoreError::NotFound).
    pub async fn get_or_load(&self, kind: &RecordKind, entity_id: &str) -> StoreResult<Value> {
        if let Some(value) = self.store.get(&kind.key(entity_id)) {
            return Ok(value);
        }
        debug!("Cache miss for {}, loading", kind.key(entity_id));
        self.load(kind, entity_id).await
    }

    /// Typed [`get_or_load`](Self::get_or_load)
    pub async fn get_or_load_as<T: DeserializeOwned>(
        &self,
        kind: &RecordKind,
        entity_id: &str,
    ) -> StoreResult<T> {
        let value = self.get_or_load(kind, entity_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Populate the record if it is not cached yet.
    ///
    /// Returns `Ok(false)` when the backend has no such record.
    pub async fn ensure_loaded(&self, kind: &RecordKind, entity_id: &str) -> StoreResult<bool> {
        if self.store.contains(&kind.key(entity_id)) {
            return Ok(true);
        }
        match self.load(kind, entity_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop a record from the cache (with any pending write-back) and from the backend
    pub async fn remove_record(&self, kind: &RecordKind, entity_id: &str) -> StoreResult<()> {
        let path = self.records.path(kind, entity_id)?;
        let _paused = self.flusher.pause().await;
        self.store.delete(&kind.key(entity_id));
        self.backend.remove(&path).await?;
        info!("Removed {} record of {}", kind, entity_id);
        Ok(())
    }

    /// Preload entities per `plan`; a no-op when `[bootstrap] enabled = false`
    pub async fn bootstrap(&self, plan: &BootstrapPlan) -> StoreResult<BootstrapReport> {
        if !self.config.bootstrap.enabled {
            info!("Bootstrap disabled, entities will load on first access");
            return Ok(BootstrapReport::empty(Utc::now()));
        }
        self.loader.run(plan).await
    }

    /// Take the exclusive lock for `entity_id`, bounded by `[lock]` config
    pub async fn lock(&self, entity_id: &str) -> StoreResult<EntityLockGuard> {
        match self.config.lock.acquire_timeout() {
            Some(timeout) => self.locks.acquire_timeout(entity_id, timeout).await,
            None => Ok(self.locks.acquire(entity_id).await),
        }
    }

    /// Run one flush pass now
    pub async fn flush(&self) -> FlushReport {
        self.flusher.flush_once().await
    }

    /// Spawn the periodic flusher and sweeper as configured
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            debug!("Background workers already running");
            return;
        }

        if self.config.flush.enabled {
            workers.push(self.flusher.spawn(self.config.flush.interval()));
        }
        if let Some(period) = self.config.cache.sweep_interval() {
            workers.push(self.store.spawn_sweeper(period));
        }
    }

    /// Stop background workers and persist every pending write-back
    pub async fn shutdown(&self) -> FlushReport {
        let workers: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            debug!("Stopping {}", worker.name());
            worker.shutdown().await;
        }

        let report = self.flusher.flush_once().await;
        info!(
            pending = self.store.dirty().len(),
            "Entity cache shut down"
        );
        report
    }

    /// Apply cache settings from a reloaded config without restarting
    pub fn apply_cache_config(&self, cache: &CacheConfig) {
        self.store.set_default_ttl(cache.default_ttl());
    }

    /// Re-read the config file and hot-apply what can change at runtime
    pub async fn reload_config(&self, manager: &ConfigManager) -> StoreResult<Config> {
        let config = manager.reload().await?;
        self.apply_cache_config(&config.cache);
        Ok(config)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.flusher.stats()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.locks.stats()
    }

    /// Keys written back but not yet persisted
    pub fn pending_writes(&self) -> Vec<String> {
        self.store.dirty().keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::record::{JsonLinesRecord, JsonRecord};
    use serde_json::json;

    const CONFIG: RecordKind = RecordKind::from_static("config");
    const RATINGS: RecordKind = RecordKind::from_static("ratings");

    fn cache() -> (EntityCache, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let records = RecordRegistry::new()
            .register(CONFIG, JsonRecord::new("events/{id}/config.json"))
            .register(RATINGS, JsonLinesRecord::new("events/{id}/ratings.jsonl"));
        let cache = EntityCache::new(backend.clone(), records, &Config::default());
        (cache, backend)
    }

    #[tokio::test]
    async fn write_through_updates_both() {
        let (cache, backend) = cache();
        cache
            .set_with_persist("config:E1", json!({"count": 0}), CONFIG, "E1")
            .await
            .unwrap();

        assert_eq!(cache.get("config:E1"), Some(json!({"count": 0})));
        let bytes = backend.read_raw("events/E1/config.json").await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"count": 0}));
    }

    #[tokio::test]
    async fn write_through_failure_keeps_cache_value() {
        let (cache, backend) = cache();
        backend.set_fail_writes(true);

        let result = cache
            .set_with_persist("config:E1", json!({"count": 9}), CONFIG, "E1")
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(cache.get("config:E1"), Some(json!({"count": 9})));
    }

    #[tokio::test]
    async fn write_through_clears_pending_write_back() {
        let (cache, _backend) = cache();
        cache.set_dirty("config:E1", json!({"count": 1}), CONFIG, "E1").unwrap();
        cache
            .set_with_persist("config:E1", json!({"count": 2}), CONFIG, "E1")
            .await
            .unwrap();

        assert!(cache.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_rejected_before_cache_write() {
        let (cache, _backend) = cache();
        let kind = RecordKind::new("profile");
        assert!(cache.set_dirty("profile:E1", json!({}), kind, "E1").is_err());
        assert_eq!(cache.get("profile:E1"), None);
    }

    #[tokio::test]
    async fn set_dirty_rejects_value_layout_cannot_encode() {
        let (cache, _backend) = cache();
        let result = cache.set_dirty("ratings:E1", json!({"not": "an array"}), RATINGS, "E1");

        assert!(result.is_err());
        assert_eq!(cache.get("ratings:E1"), None);
        assert!(cache.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn load_keeps_newer_cached_value() {
        let (cache, backend) = cache();
        backend
            .write_raw("events/E1/config.json", br#"{"count":0}"#)
            .await
            .unwrap();
        cache.set("config:E1", json!({"count": 1}));

        assert_eq!(cache.load(&CONFIG, "E1").await.unwrap(), json!({"count": 1}));
        assert_eq!(cache.get("config:E1"), Some(json!({"count": 1})));
    }

    #[tokio::test]
    async fn bootstrap_skipped_when_disabled() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write_raw("events/E1/config.json", b"{}")
            .await
            .unwrap();
        let mut config = Config::default();
        config.bootstrap.enabled = false;
        let records =
            RecordRegistry::new().register(CONFIG, JsonRecord::new("events/{id}/config.json"));
        let cache = EntityCache::new(backend, records, &config);

        let report = cache
            .bootstrap(&BootstrapPlan::from_config(&config.bootstrap, CONFIG))
            .await
            .unwrap();

        assert_eq!(report.entities, 0);
        assert_eq!(cache.get("config:E1"), None);
    }

    #[tokio::test]
    async fn get_or_load_surfaces_not_found() {
        let (cache, _backend) = cache();
        let err = cache.get_or_load(&CONFIG, "E404").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!cache.ensure_loaded(&CONFIG, "E404").await.unwrap());
    }

    #[tokio::test]
    async fn lazy_load_populates_cache() {
        let (cache, backend) = cache();
        backend
            .write_raw("events/E1/ratings.jsonl", b"{\"score\":5}\n")
            .await
            .unwrap();

        assert!(cache.ensure_loaded(&RATINGS, "E1").await.unwrap());
        assert_eq!(cache.get("ratings:E1"), Some(json!([{"score": 5}])));

        // Second call is a no-op even if the backend changes
        backend.write_raw("events/E1/ratings.jsonl", b"").await.unwrap();
        assert!(cache.ensure_loaded(&RATINGS, "E1").await.unwrap());
        assert_eq!(cache.get("ratings:E1"), Some(json!([{"score": 5}])));
    }

    #[tokio::test]
    async fn remove_record_clears_everything() {
        let (cache, backend) = cache();
        cache
            .set_with_persist("config:E1", json!({}), CONFIG, "E1")
            .await
            .unwrap();
        cache.set_dirty("config:E1", json!({"v": 2}), CONFIG, "E1").unwrap();

        cache.remove_record(&CONFIG, "E1").await.unwrap();
        cache.flush().await;

        assert!(!backend.contains("events/E1/config.json"));
        assert_eq!(cache.get("config:E1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn config_reload_changes_default_ttl() {
        let (cache, _backend) = cache();
        cache.apply_cache_config(&CacheConfig {
            default_ttl_secs: 1,
            sweep_interval_secs: 0,
        });
        cache.set("computed:E1:avg", json!(3.5));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("computed:E1:avg"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_writes() {
        let (cache, backend) = cache();
        cache.start().await;
        cache.set_dirty("config:E1", json!({"count": 4}), CONFIG, "E1").unwrap();

        cache.shutdown().await;

        assert!(backend.contains("events/E1/config.json"));
        assert!(cache.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn configured_lock_timeout_applies() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = Config::default();
        config.lock.acquire_timeout_secs = 1;
        let cache = EntityCache::new(backend, RecordRegistry::new(), &config);

        let _held = cache.lock("E1").await.unwrap();
        tokio::time::pause();
        let err = cache.lock("E1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
