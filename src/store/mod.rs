//! In-memory cache store
//!
//! The store is the single read/write surface for cached entity data. Reads
//! never touch the persistence backend; a missing key means "unknown", and it
//! is up to the caller (usually [`EntityCache`](crate::EntityCache)) to load it.
//!
//! # Expiry
//!
//! | Entry            | Behaviour                                           |
//! |------------------|-----------------------------------------------------|
//! | No TTL           | Lives until `delete`/`invalidate` or restart        |
//! | TTL elapsed      | Treated as absent on `get`, removed by the sweeper  |
//! | TTL elapsed, dirty | Kept and served until the flusher has written it  |

pub mod pattern;

pub use pattern::KeyPattern;

use crate::dirty::DirtyTracker;
use crate::error::StoreResult;
use crate::worker::{spawn_periodic, WorkerHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Number of entries currently held (expired ones included until swept)
    pub entries: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped by `delete` or `invalidate`
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Concurrent key/value cache with per-entry TTL
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    dirty: Arc<DirtyTracker>,
    default_ttl: RwLock<Option<Duration>>,
    counters: Counters,
}

impl CacheStore {
    /// Create a store sharing `dirty` with the write-back path
    pub fn new(dirty: Arc<DirtyTracker>, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            dirty,
            default_ttl: RwLock::new(default_ttl),
            counters: Counters::default(),
        }
    }

    /// The dirty tracker this store keeps consistent on delete
    pub fn dirty(&self) -> &Arc<DirtyTracker> {
        &self.dirty
    }

    /// TTL applied by [`set`](Self::set)
    pub fn default_ttl(&self) -> Option<Duration> {
        *self
            .default_ttl
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Change the default TTL for subsequent writes; existing entries keep theirs
    pub fn set_default_ttl(&self, ttl: Option<Duration>) {
        *self
            .default_ttl
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ttl;
        info!("Cache default TTL set to {:?}", ttl);
    }

    /// Get a value, or `None` if absent or expired
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let (value, expired) = match self.entries.get(key) {
            Some(entry) => (entry.value.clone(), entry.is_expired(now)),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired && !self.dirty.contains(key) {
            if self
                .entries
                .remove_if(key, |_, entry| entry.is_expired(now))
                .is_some()
            {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache entry {} expired", key);
            return None;
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Get and deserialize a value
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Current value regardless of TTL, without touching statistics
    pub(crate) fn current_value(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Store a value with the default TTL, overwriting unconditionally
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl());
    }

    /// Store a value with an explicit TTL (`None` never expires)
    pub fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Store `value` only if no live entry holds the key; returns the value
    /// the cache ends up holding.
    ///
    /// Used when populating from the backend, so a write that completed while
    /// the read was in flight is never replaced by the older disk copy.
    pub fn insert_if_absent(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Value {
        let key = key.into();
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let stale =
                    occupied.get().is_expired(now) && !self.dirty.contains(occupied.key());
                if stale {
                    occupied.insert(CacheEntry {
                        value: value.clone(),
                        expires_at,
                    });
                    value
                } else {
                    occupied.get().value.clone()
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    value: value.clone(),
                    expires_at,
                });
                value
            }
        }
    }

    /// Serialize and store a value with the default TTL
    pub fn set_typed<T: Serialize>(&self, key: impl Into<String>, value: &T) -> StoreResult<()> {
        self.set(key, serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove a key and any pending write-back for it
    pub fn delete(&self, key: &str) -> usize {
        // Drop the dirty record first so a concurrent flush cannot resurrect it
        self.dirty.remove(key);
        let removed = usize::from(self.entries.remove(key).is_some());
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Whether a live (unexpired or dirty) entry exists
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return false,
        };
        !expired || self.dirty.contains(key)
    }

    /// Live keys matching a `*` glob, sorted
    pub fn list_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let pattern = KeyPattern::new(pattern)?;
        let pinned = self.pinned_keys();
        let now = Instant::now();

        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .filter(|entry| !entry.value().is_expired(now) || pinned.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        keys.sort();
        Ok(keys)
    }

    /// Delete every key matching a `*` glob, dirty ones included
    pub fn invalidate(&self, pattern: &str) -> StoreResult<usize> {
        let pattern = KeyPattern::new(pattern)?;

        self.dirty.remove_where(|key| pattern.matches(key));

        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            let hit = pattern.matches(key);
            removed += usize::from(hit);
            !hit
        });

        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!("Invalidated {} keys matching {}", removed, pattern.as_str());
        }
        Ok(removed)
    }

    /// Remove expired entries that have no pending write-back
    pub fn sweep_expired(&self) -> usize {
        let pinned = self.pinned_keys();
        let now = Instant::now();

        let mut removed = 0usize;
        self.entries.retain(|key, entry| {
            let drop = entry.is_expired(now) && !pinned.contains(key);
            removed += usize::from(drop);
            !drop
        });

        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    /// Sweep expired entries every `period` until the handle is shut down
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> WorkerHandle {
        let store = Arc::clone(self);
        spawn_periodic("cache-sweeper", period, false, move || {
            let store = Arc::clone(&store);
            async move {
                store.sweep_expired();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    fn pinned_keys(&self) -> HashSet<String> {
        self.dirty.keys().into_iter().collect()
    }
}
