//! In-memory persistence backend
//!
//! Useful for embedding without a disk and for exercising failure paths:
//! writes can be made to fail on demand.

use crate::backend::PersistenceBackend;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

/// Path-keyed byte store held in process memory
#[derive(Default)]
pub struct MemoryBackend {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write_raw` fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether anything is stored at exactly `path`
    pub fn contains(&self, path: &str) -> bool {
        self.read_files().contains_key(normalize(path))
    }

    fn read_files(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_files(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn read_raw(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.read_files()
            .get(normalize(path))
            .cloned()
            .ok_or_else(|| StoreError::not_found(path))
    }

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::io(
                format!("writing {}", path),
                std::io::Error::other("injected write failure"),
            ));
        }
        self.write_files()
            .insert(normalize(path).to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let base = normalize(path);
        let prefix = if base.is_empty() {
            String::new()
        } else {
            format!("{}/", base)
        };

        let files = self.read_files();
        let mut children: Vec<String> = files
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        if children.is_empty() {
            return Err(StoreError::not_found(path));
        }

        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let target = normalize(path).to_string();
        let dir_prefix = format!("{}/", target);
        self.write_files()
            .retain(|key, _| *key != target && !key.starts_with(&dir_prefix));
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
