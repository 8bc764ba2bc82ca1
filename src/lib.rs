//! Warmstore - cache-as-source-of-truth persistence
//!
//! An in-memory cache serves every read for a set of named entities and
//! absorbs writes immediately. Durable storage is reconciled either
//! synchronously (write-through) or by a periodic flusher (write-back), and
//! per-entity locks serialize read-modify-write sequences.

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod dirty;
pub mod error;
pub mod flusher;
pub mod lock;
pub mod logging;
pub mod record;
pub mod repository;
pub mod store;
pub mod worker;

pub use backend::{FsBackend, MemoryBackend, PersistenceBackend};
pub use bootstrap::{BootstrapLoader, BootstrapPlan, BootstrapReport};
pub use error::{StoreError, StoreResult};
pub use lock::{EntityLockGuard, EntityLockManager};
pub use record::{JsonLinesRecord, JsonRecord, RecordKind, RecordLayout, RecordRegistry};
pub use repository::EntityCache;
pub use store::CacheStore;
