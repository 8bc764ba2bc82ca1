//! Durable storage abstraction
//!
//! The cache never assumes a storage medium. Paths are opaque, `/`-separated
//! strings chosen by the caller (usually through a [`RecordLayout`]).
//!
//! [`RecordLayout`]: crate::record::RecordLayout

pub mod fs;
pub mod memory;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

use crate::error::StoreResult;
use async_trait::async_trait;

/// Abstract persistence backend interface
///
/// Implementations must be safe to call concurrently from the flusher and
/// from write-through callers.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Read the full contents stored at `path`.
    ///
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) when
    /// nothing is stored there.
    async fn read_raw(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Replace the contents stored at `path`. Readers never observe a partial write.
    async fn write_raw(&self, path: &str, bytes: &[u8]) -> StoreResult<()>;

    /// List the immediate child names under `path`, sorted.
    async fn list_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Remove whatever is stored at `path`. Removing a missing path is not an error.
    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Get the human-readable backend name for logs
    fn backend_name(&self) -> &'static str;
}
