//! Background persistence of write-back entries
//!
//! One pass:
//! 1. snapshot and clear the live dirty set,
//! 2. for each record, read the value the cache holds *now*,
//! 3. encode and write it; transient failures go back into the dirty set.
//!
//! A record that can never be written (unknown kind, value the layout cannot
//! encode) is dropped with an error instead of being retried forever. Keys
//! deleted since the snapshot are skipped. Because the latest value is
//! always the one written, a pass may persist data newer than the write that
//! marked the key dirty.

use crate::backend::PersistenceBackend;
use crate::dirty::{DirtyRecord, DirtyTracker};
use crate::error::StoreResult;
use crate::record::RecordRegistry;
use crate::store::CacheStore;
use crate::worker::{spawn_periodic, WorkerHandle};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

/// Outcome of a single flush pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    /// Records whose key was deleted before it could be written
    pub skipped: usize,
    /// Records that failed and were re-queued
    pub failed: usize,
    /// Records that failed permanently and were discarded
    pub dropped: usize,
    pub finished_at: DateTime<Utc>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.persisted == 0 && self.skipped == 0 && self.failed == 0 && self.dropped == 0
    }
}

/// Cumulative flusher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub passes: u64,
    pub persisted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dropped: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    persisted: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
}

/// Drains the dirty tracker into the persistence backend
pub struct Flusher {
    store: Arc<CacheStore>,
    backend: Arc<dyn PersistenceBackend>,
    records: Arc<RecordRegistry>,
    // Passes take it exclusively; `pause` holders share it
    pass_lock: RwLock<()>,
    counters: Counters,
}

impl Flusher {
    pub fn new(
        store: Arc<CacheStore>,
        backend: Arc<dyn PersistenceBackend>,
        records: Arc<RecordRegistry>,
    ) -> Self {
        Self {
            store,
            backend,
            records,
            pass_lock: RwLock::new(()),
            counters: Counters::default(),
        }
    }

    fn dirty(&self) -> &DirtyTracker {
        self.store.dirty()
    }

    /// Keep flush passes from running while the guard is held.
    ///
    /// Waits for a pass in progress to finish. Operations that write or
    /// remove a record on the backend directly hold this so an in-flight pass
    /// cannot land an older value afterwards.
    pub async fn pause(&self) -> RwLockReadGuard<'_, ()> {
        self.pass_lock.read().await
    }

    /// Run one flush pass
    pub async fn flush_once(&self) -> FlushReport {
        let _pass = self.pass_lock.write().await;

        let snapshot = self.dirty().take_all();
        let mut persisted = 0;
        let mut skipped = 0;
        let mut failed = 0;
        let mut dropped = 0;

        for record in snapshot {
            let Some(value) = self.store.current_value(&record.key) else {
                debug!("Skipping flush of {}: key no longer cached", record.key);
                skipped += 1;
                continue;
            };

            match self.persist(&record, &value).await {
                Ok(path) => {
                    debug!("Flushed {} to {}", record.key, path);
                    persisted += 1;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Failed to flush {} ({}): {}", record.key, record.entity_id, e);
                    failed += 1;
                    self.dirty().requeue(record);
                }
                Err(e) => {
                    error!(
                        "Dropping write-back of {} ({}), it cannot be persisted: {}",
                        record.key, record.entity_id, e
                    );
                    dropped += 1;
                }
            }
        }

        let finished_at = Utc::now();
        let report = FlushReport {
            persisted,
            skipped,
            failed,
            dropped,
            finished_at,
        };
        self.record_pass(&report);

        if !report.is_empty() {
            info!(
                persisted = report.persisted,
                skipped = report.skipped,
                failed = report.failed,
                dropped = report.dropped,
                "Flush pass complete"
            );
        }
        report
    }

    async fn persist(&self, record: &DirtyRecord, value: &serde_json::Value) -> StoreResult<String> {
        let layout = self.records.layout(&record.kind)?;
        let path = layout.path(&record.entity_id);
        let bytes = layout.encode(value)?;
        self.backend.write_raw(&path, &bytes).await?;
        Ok(path)
    }

    fn record_pass(&self, report: &FlushReport) {
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .persisted
            .fetch_add(report.persisted as u64, Ordering::Relaxed);
        self.counters
            .skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        *self
            .counters
            .last_flush_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.finished_at);
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            passes: self.counters.passes.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            last_flush_at: *self
                .counters
                .last_flush_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Flush every `interval`; shutting the handle down runs a final pass
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> WorkerHandle {
        info!("Starting flusher, interval {:?}", interval);
        let flusher = Arc::clone(self);
        spawn_periodic("flusher", interval, true, move || {
            let flusher = Arc::clone(&flusher);
            async move {
                flusher.flush_once().await;
            }
        })
    }
}
