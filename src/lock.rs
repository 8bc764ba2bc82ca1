//! Per-entity exclusive locks
//!
//! Every read-modify-write on a shared entity goes through
//! acquire → re-read → compute → write → release. The guard releases on drop,
//! so early returns and `?` cannot leak a lock.
//!
//! Waiters are served in arrival order (`tokio::sync::Mutex` is FIFO). A slot
//! in the lock table exists only while someone holds or waits for it.

use crate::error::{StoreError, StoreResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Lock usage counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquisitions: u64,
    /// Acquisitions that had to wait for another holder
    pub contended: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<String, Slot>>,
    acquisitions: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
}

impl LockTable {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, entity_id: &str) -> Slot {
        Arc::clone(self.slots().entry(entity_id.to_string()).or_default())
    }

    /// Forget the slot once the caller's clone is the last one outside the table
    fn release(&self, entity_id: &str, slot: Slot) {
        let mut slots = self.slots();
        let idle = slots
            .get(entity_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2);
        if idle {
            slots.remove(entity_id);
        }
    }
}

/// Exclusive hold on one entity; released when dropped
#[must_use = "the entity lock is released as soon as the guard is dropped"]
pub struct EntityLockGuard {
    entity_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Option<Slot>,
    table: Arc<LockTable>,
}

impl EntityLockGuard {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Release explicitly; equivalent to dropping the guard
    pub fn release(self) {}
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(slot) = self.slot.take() {
            self.table.release(&self.entity_id, slot);
        }
    }
}

impl std::fmt::Debug for EntityLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLockGuard")
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

/// Issues one exclusive lock per entity id
#[derive(Clone, Default)]
pub struct EntityLockManager {
    table: Arc<LockTable>,
}

impl EntityLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock for `entity_id` is free and take it
    pub async fn acquire(&self, entity_id: &str) -> EntityLockGuard {
        let slot = self.table.slot(entity_id);
        let guard = match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.table.contended.fetch_add(1, Ordering::Relaxed);
                debug!("Lock contention on entity {}", entity_id);
                Arc::clone(&slot).lock_owned().await
            }
        };
        self.granted(entity_id, slot, guard)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`
    pub async fn acquire_timeout(
        &self,
        entity_id: &str,
        timeout: Duration,
    ) -> StoreResult<EntityLockGuard> {
        let slot = self.table.slot(entity_id);
        let guard = match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.table.contended.fetch_add(1, Ordering::Relaxed);
                debug!("Lock contention on entity {}", entity_id);
                match tokio::time::timeout(timeout, Arc::clone(&slot).lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        self.table.timeouts.fetch_add(1, Ordering::Relaxed);
                        self.table.release(entity_id, slot);
                        warn!("Gave up waiting {:?} for lock on entity {}", timeout, entity_id);
                        return Err(StoreError::LockTimeout {
                            entity_id: entity_id.to_string(),
                            waited: timeout,
                        });
                    }
                }
            }
        };
        Ok(self.granted(entity_id, slot, guard))
    }

    /// Take the lock only if nobody holds or waits for it
    pub fn try_acquire(&self, entity_id: &str) -> Option<EntityLockGuard> {
        let slot = self.table.slot(entity_id);
        match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => Some(self.granted(entity_id, slot, guard)),
            Err(_) => {
                self.table.release(entity_id, slot);
                None
            }
        }
    }

    /// Run `f` while holding the lock for `entity_id`
    pub async fn with_lock<F, Fut, T>(&self, entity_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(entity_id).await;
        f().await
    }

    /// Number of entities currently held or waited on
    pub fn active_locks(&self) -> usize {
        self.table.slots().len()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.table.acquisitions.load(Ordering::Relaxed),
            contended: self.table.contended.load(Ordering::Relaxed),
            timeouts: self.table.timeouts.load(Ordering::Relaxed),
        }
    }

    fn granted(&self, entity_id: &str, slot: Slot, guard: OwnedMutexGuard<()>) -> EntityLockGuard {
        self.table.acquisitions.fetch_add(1, Ordering::Relaxed);
        EntityLockGuard {
            entity_id: entity_id.to_string(),
            guard: Some(guard),
            slot: Some(slot),
            table: Arc::clone(&self.table),
        }
    }
}
