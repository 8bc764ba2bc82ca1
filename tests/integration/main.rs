//! Integration tests for warmstore

mod entity_cache_tests {
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use warmstore::config::Config;
    use warmstore::{
        BootstrapPlan, EntityCache, FsBackend, JsonLinesRecord, JsonRecord, MemoryBackend,
        PersistenceBackend, RecordKind, RecordRegistry,
    };

    const CONFIG: RecordKind = RecordKind::from_static("config");
    const RATINGS: RecordKind = RecordKind::from_static("ratings");

    fn records() -> RecordRegistry {
        RecordRegistry::new()
            .register(CONFIG, JsonRecord::new("events/{id}/config.json"))
            .register(RATINGS, JsonLinesRecord::new("events/{id}/ratings.jsonl"))
    }

    fn fs_cache(temp: &TempDir) -> EntityCache {
        let mut config = Config::default();
        config.storage.root = temp.path().to_path_buf();
        EntityCache::open(records(), &config)
    }

    async fn on_disk(backend: &dyn PersistenceBackend, path: &str) -> Option<Value> {
        match backend.read_raw(path).await {
            Ok(bytes) => Some(serde_json::from_slice(&bytes).unwrap()),
            Err(e) if e.is_not_found() => None,
            Err(e) => panic!("unexpected backend error: {e}"),
        }
    }

    #[tokio::test]
    async fn read_your_write_in_every_mode() {
        let temp = TempDir::new().unwrap();
        let cache = fs_cache(&temp);

        cache.set("computed:E1:avg", json!(4.0));
        assert_eq!(cache.get("computed:E1:avg"), Some(json!(4.0)));

        cache
            .set_dirty("ratings:E1", json!([{"score": 4}]), RATINGS, "E1")
            .unwrap();
        assert_eq!(cache.get("ratings:E1"), Some(json!([{"score": 4}])));

        cache
            .set_with_persist("config:E1", json!({"count": 0}), CONFIG, "E1")
            .await
            .unwrap();
        assert_eq!(cache.get("config:E1"), Some(json!({"count": 0})));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry() {
        let cache = EntityCache::new(Arc::new(MemoryBackend::new()), records(), &Config::default());
        cache.set_with_ttl("computed:E1:avg", json!(2.5), Some(Duration::from_secs(1)));
        assert_eq!(cache.get("computed:E1:avg"), Some(json!(2.5)));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("computed:E1:avg"), None);
    }

    #[tokio::test]
    async fn write_back_durability_window() {
        let temp = TempDir::new().unwrap();
        let cache = fs_cache(&temp);

        cache
            .set_dirty("ratings:E1", json!([{"score": 3}]), RATINGS, "E1")
            .unwrap();

        let path = temp.path().join("events/E1/ratings.jsonl");
        assert!(!path.exists(), "nothing reaches disk before a flush");

        let report = cache.flush().await;
        assert_eq!(report.persisted, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"score\":3}\n");
    }

    #[tokio::test]
    async fn write_through_atomicity() {
        let temp = TempDir::new().unwrap();
        let cache = fs_cache(&temp);

        cache
            .set_with_persist("config:E1", json!({"name": "launch"}), CONFIG, "E1")
            .await
            .unwrap();

        // Fresh backend over the same root sees the value
        let fresh = FsBackend::new(temp.path());
        assert_eq!(
            on_disk(&fresh, "events/E1/config.json").await,
            Some(json!({"name": "launch"}))
        );
        assert_eq!(cache.get("config:E1"), Some(json!({"name": "launch"})));
    }

    #[tokio::test]
    async fn delete_suppresses_pending_flush() {
        let temp = TempDir::new().unwrap();
        let cache = fs_cache(&temp);

        cache
            .set_dirty("config:E1", json!({"count": 7}), CONFIG, "E1")
            .unwrap();
        assert_eq!(cache.delete("config:E1"), 1);

        let report = cache.flush().await;

        assert_eq!(report.persisted, 0);
        assert_eq!(on_disk(cache.backend().as_ref(), "events/E1/config.json").await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serialized_mutation_has_no_lost_updates() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(fs_cache(&temp));
        cache
            .set_with_persist("config:E1", json!({"count": 10}), CONFIG, "E1")
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                let _guard = cache.lock("E1").await.unwrap();
                let current = cache.get_or_load(&CONFIG, "E1").await.unwrap();
                let count = current["count"].as_u64().unwrap();
                tokio::task::yield_now().await;
                cache
                    .set_dirty("config:E1", json!({"count": count + 1}), CONFIG, "E1")
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.get("config:E1"), Some(json!({"count": 74})));
        cache.flush().await;
        assert_eq!(
            on_disk(cache.backend().as_ref(), "events/E1/config.json").await,
            Some(json!({"count": 74}))
        );
        assert_eq!(cache.locks().active_locks(), 0);
    }

    #[tokio::test]
    async fn pattern_invalidation() {
        let cache = EntityCache::new(Arc::new(MemoryBackend::new()), records(), &Config::default());
        cache.set("a:1", json!(1));
        cache.set("a:2", json!(2));
        cache.set("b:1", json!(3));

        assert_eq!(cache.invalidate("a:*").unwrap(), 2);

        assert_eq!(cache.list_keys("*").unwrap(), vec!["b:1".to_string()]);
    }

    #[tokio::test]
    async fn bootstrap_resilience() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        backend
            .write_raw("events/E1/config.json", br#"{"status":"active"}"#)
            .await
            .unwrap();
        backend
            .write_raw("events/E1/ratings.jsonl", b"{\"score\":5}\n")
            .await
            .unwrap();
        backend
            .write_raw("events/E2/config.json", b"{\"status\": ")
            .await
            .unwrap();
        backend
            .write_raw("events/E3/config.json", br#"{"status":"draft"}"#)
            .await
            .unwrap();

        let cache = fs_cache(&temp);
        let plan = BootstrapPlan::from_config(&Config::default().bootstrap, CONFIG)
            .with_secondary(RATINGS, |_, config| config["status"] == "active");
        let report = cache.bootstrap(&plan).await.unwrap();

        assert_eq!(report.entities, 3);
        assert_eq!(report.primary_loaded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].entity_id, "E2");

        assert!(cache.get("config:E1").is_some());
        assert!(cache.get("config:E3").is_some());
        assert!(cache.get("config:E2").is_none());

        // Active entity got its ratings eagerly, the draft one loads lazily
        assert_eq!(cache.get("ratings:E1"), Some(json!([{"score": 5}])));
        assert_eq!(cache.get("ratings:E3"), None);
        assert!(!cache.ensure_loaded(&RATINGS, "E3").await.unwrap());
    }

    #[tokio::test]
    async fn end_to_end_write_through_then_write_back() {
        let temp = TempDir::new().unwrap();
        let cache = fs_cache(&temp);
        let path = "events/E1/config.json";

        assert!(cache.get_or_load(&CONFIG, "E1").await.unwrap_err().is_not_found());

        cache
            .set_with_persist("config:E1", json!({"count": 0}), CONFIG, "E1")
            .await
            .unwrap();
        assert_eq!(
            on_disk(cache.backend().as_ref(), path).await,
            Some(json!({"count": 0}))
        );

        let guard = cache.lock("E1").await.unwrap();
        assert_eq!(cache.get("config:E1"), Some(json!({"count": 0})));
        cache
            .set_dirty("config:E1", json!({"count": 1}), CONFIG, "E1")
            .unwrap();
        guard.release();

        assert_eq!(cache.get("config:E1"), Some(json!({"count": 1})));
        assert_eq!(
            on_disk(cache.backend().as_ref(), path).await,
            Some(json!({"count": 0}))
        );

        cache.flush().await;

        assert_eq!(
            on_disk(cache.backend().as_ref(), path).await,
            Some(json!({"count": 1}))
        );
        assert_eq!(cache.flush_stats().persisted, 1);
    }

    #[tokio::test]
    async fn failed_flush_is_retried_next_pass() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = EntityCache::new(backend.clone(), records(), &Config::default());

        cache
            .set_dirty("config:E1", json!({"count": 1}), CONFIG, "E1")
            .unwrap();
        backend.set_fail_writes(true);
        assert_eq!(cache.flush().await.failed, 1);
        assert_eq!(cache.pending_writes(), vec!["config:E1".to_string()]);

        // A newer write lands before the retry; the retry persists it
        cache
            .set_dirty("config:E1", json!({"count": 2}), CONFIG, "E1")
            .unwrap();
        backend.set_fail_writes(false);
        assert_eq!(cache.flush().await.persisted, 1);

        assert_eq!(
            on_disk(backend.as_ref(), "events/E1/config.json").await,
            Some(json!({"count": 2}))
        );
        assert!(cache.pending_writes().is_empty());
    }
}

mod interleaving_tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;
    use warmstore::config::Config;
    use warmstore::{
        EntityCache, JsonRecord, MemoryBackend, PersistenceBackend, RecordKind, RecordRegistry,
        StoreResult,
    };

    const CONFIG: RecordKind = RecordKind::from_static("config");
    const PATH: &str = "events/E1/config.json";

    /// Memory backend that can hold the next read or write after it has
    /// touched the data, until released
    #[derive(Default)]
    struct GatedBackend {
        inner: MemoryBackend,
        hold_read: AtomicBool,
        hold_write: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl GatedBackend {
        async fn hold(&self) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }

    #[async_trait]
    impl PersistenceBackend for GatedBackend {
        async fn read_raw(&self, path: &str) -> StoreResult<Vec<u8>> {
            let bytes = self.inner.read_raw(path).await?;
            if self.hold_read.swap(false, Ordering::SeqCst) {
                self.hold().await;
            }
            Ok(bytes)
        }

        async fn write_raw(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
            if self.hold_write.swap(false, Ordering::SeqCst) {
                // Reached the backend but has not written yet
                self.hold().await;
            }
            self.inner.write_raw(path, bytes).await
        }

        async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
            self.inner.list_children(path).await
        }

        async fn remove(&self, path: &str) -> StoreResult<()> {
            self.inner.remove(path).await
        }

        fn backend_name(&self) -> &'static str {
            "gated"
        }
    }

    fn setup() -> (Arc<EntityCache>, Arc<GatedBackend>) {
        let backend = Arc::new(GatedBackend::default());
        let records =
            RecordRegistry::new().register(CONFIG, JsonRecord::new("events/{id}/config.json"));
        let cache = Arc::new(EntityCache::new(backend.clone(), records, &Config::default()));
        (cache, backend)
    }

    async fn on_disk(backend: &GatedBackend) -> Option<Value> {
        match backend.inner.read_raw(PATH).await {
            Ok(bytes) => Some(serde_json::from_slice(&bytes).unwrap()),
            Err(e) if e.is_not_found() => None,
            Err(e) => panic!("unexpected backend error: {e}"),
        }
    }

    #[tokio::test]
    async fn lazy_load_does_not_clobber_concurrent_write_through() {
        let (cache, backend) = setup();
        backend
            .inner
            .write_raw(PATH, br#"{"count":0}"#)
            .await
            .unwrap();

        backend.hold_read.store(true, Ordering::SeqCst);
        let loader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_load(&CONFIG, "E1").await })
        };
        backend.reached.notified().await;

        cache
            .set_with_persist("config:E1", json!({"count": 1}), CONFIG, "E1")
            .await
            .unwrap();
        backend.release.notify_one();

        assert_eq!(loader.await.unwrap().unwrap(), json!({"count": 1}));
        assert_eq!(cache.get("config:E1"), Some(json!({"count": 1})));
        assert_eq!(on_disk(&backend).await, Some(json!({"count": 1})));
    }

    #[tokio::test]
    async fn in_flight_flush_cannot_recreate_removed_record() {
        let (cache, backend) = setup();
        cache
            .set_dirty("config:E1", json!({"count": 5}), CONFIG, "E1")
            .unwrap();

        backend.hold_write.store(true, Ordering::SeqCst);
        let flush = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.flush().await })
        };
        backend.reached.notified().await;

        let remove = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.remove_record(&CONFIG, "E1").await })
        };
        tokio::task::yield_now().await;
        backend.release.notify_one();

        assert_eq!(flush.await.unwrap().persisted, 1);
        remove.await.unwrap().unwrap();

        assert_eq!(cache.get("config:E1"), None);
        assert_eq!(on_disk(&backend).await, None);
    }

    #[tokio::test]
    async fn in_flight_flush_cannot_overwrite_later_write_through() {
        let (cache, backend) = setup();
        cache
            .set_dirty("config:E1", json!({"count": 1}), CONFIG, "E1")
            .unwrap();

        backend.hold_write.store(true, Ordering::SeqCst);
        let flush = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.flush().await })
        };
        backend.reached.notified().await;

        let write = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .set_with_persist("config:E1", json!({"count": 2}), CONFIG, "E1")
                    .await
            })
        };
        tokio::task::yield_now().await;
        backend.release.notify_one();

        flush.await.unwrap();
        write.await.unwrap().unwrap();

        assert_eq!(on_disk(&backend).await, Some(json!({"count": 2})));
        assert_eq!(cache.get("config:E1"), Some(json!({"count": 2})));
        assert!(cache.pending_writes().is_empty());
    }
}
