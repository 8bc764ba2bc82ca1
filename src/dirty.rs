//! Dirty-key bookkeeping for the write-back path
//!
//! A dirty record says "the cached value under `key` still has to be written
//! as `kind` of `entity_id`". It never holds the value itself: the flusher
//! always persists whatever the cache holds at flush time.

use crate::record::RecordKind;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Pending persistence action for one cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRecord {
    pub key: String,
    pub kind: RecordKind,
    pub entity_id: String,
}

impl DirtyRecord {
    pub fn new(key: impl Into<String>, kind: RecordKind, entity_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            entity_id: entity_id.into(),
        }
    }
}

/// Live set of dirty records, at most one per key
#[derive(Debug, Default)]
pub struct DirtyTracker {
    records: Mutex<HashMap<String, DirtyRecord>>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, DirtyRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record intent to persist; replaces any older record for the same key
    pub fn mark(&self, record: DirtyRecord) {
        self.records().insert(record.key.clone(), record);
    }

    /// Drop the pending record for `key`, returning it if there was one
    pub fn remove(&self, key: &str) -> Option<DirtyRecord> {
        self.records().remove(key)
    }

    /// Drop every pending record whose key satisfies `predicate`
    pub fn remove_where(&self, mut predicate: impl FnMut(&str) -> bool) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|key, _| !predicate(key));
        before - records.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Currently dirty keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot and clear the live set in one step.
    ///
    /// Writes that land after this call start a fresh set and are picked up
    /// by the next pass.
    pub fn take_all(&self) -> Vec<DirtyRecord> {
        let drained = std::mem::take(&mut *self.records());
        let mut records: Vec<DirtyRecord> = drained.into_values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Put a record back after a failed flush.
    ///
    /// A record marked since the snapshot is newer and wins. Returns whether
    /// the record was re-inserted.
    pub fn requeue(&self, record: DirtyRecord) -> bool {
        let mut records = self.records();
        if records.contains_key(&record.key) {
            return false;
        }
        records.insert(record.key.clone(), record);
        true
    }
}
