//! Filesystem persistence backend

use crate::backend::PersistenceBackend;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::debug;

/// Stores each record as a file below a root directory.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous version intact.
pub struct FsBackend {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl FsBackend {
    /// Create a backend rooted at `root` (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an opaque backend path below the root, rejecting escapes
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StoreError::io(
                format!("resolving backend path {}", path),
                std::io::Error::new(ErrorKind::InvalidInput, "path escapes storage root"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn temp_path_for(&self, target: &Path) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{}.{}.tmp", name, seq))
    }
}

#[async_trait]
impl PersistenceBackend for FsBackend {
    async fn read_raw(&self, path: &str) -> StoreResult<Vec<u8>> {
        let full = self.resolve(path)?;
        match fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(path)),
            Err(e) => Err(StoreError::io(format!("reading {}", full.display()), e)),
        }
    }

    async fn write_raw(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        let full = self.resolve(path)?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(format!("creating directory {}", parent.display()), e))?;
        }

        let temp = self.temp_path_for(&full);
        fs::write(&temp, bytes)
            .await
            .map_err(|e| StoreError::io(format!("writing {}", temp.display()), e))?;

        if let Err(e) = fs::rename(&temp, &full).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::io(format!("renaming into {}", full.display()), e));
        }

        debug!("Wrote {} bytes to {}", bytes.len(), full.display());
        Ok(())
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let full = self.resolve(path)?;
        let mut entries = match fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::not_found(path)),
            Err(e) => return Err(StoreError::io(format!("listing {}", full.display()), e)),
        };

        let mut names = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("reading entry in {}", full.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip in-flight temp files
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let metadata = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(format!("inspecting {}", full.display()), e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("removing {}", full.display()), e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
