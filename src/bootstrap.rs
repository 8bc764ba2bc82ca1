//! Startup preload of entity records
//!
//! Every entity under the plan's root gets its primary record cached. Entities
//! accepted by the preload predicate also get their secondary record cached;
//! the rest load it lazily through
//! [`EntityCache::ensure_loaded`](crate::EntityCache::ensure_loaded).
//!
//! One unreadable entity never stops the others from loading.

use crate::backend::PersistenceBackend;
use crate::config::BootstrapConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::{RecordKind, RecordRegistry};
use crate::store::CacheStore;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides from an entity's primary record whether to preload its secondary record
pub type PreloadPredicate = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// What to preload at startup
#[derive(Clone)]
pub struct BootstrapPlan {
    /// Backend path whose children are entity ids
    pub entities_root: String,
    pub primary: RecordKind,
    pub secondary: Option<RecordKind>,
    pub preload_extras: PreloadPredicate,
    pub concurrency: usize,
}

impl BootstrapPlan {
    /// Preload only `primary` for every entity under `entities_root`
    pub fn new(entities_root: impl Into<String>, primary: impl Into<RecordKind>) -> Self {
        Self {
            entities_root: entities_root.into(),
            primary: primary.into(),
            secondary: None,
            preload_extras: Arc::new(|_, _| false),
            concurrency: 8,
        }
    }

    /// Build a plan from the `[bootstrap]` config section
    pub fn from_config(config: &BootstrapConfig, primary: impl Into<RecordKind>) -> Self {
        Self::new(config.entities_root.clone(), primary).with_concurrency(config.concurrency)
    }

    /// Also preload `secondary` for entities whose primary record satisfies `predicate`
    pub fn with_secondary<P>(mut self, secondary: impl Into<RecordKind>, predicate: P) -> Self
    where
        P: Fn(&str, &Value) -> bool + Send + Sync + 'static,
    {
        self.secondary = Some(secondary.into());
        self.preload_extras = Arc::new(predicate);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

impl fmt::Debug for BootstrapPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapPlan")
            .field("entities_root", &self.entities_root)
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// An entity record that could not be preloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFailure {
    pub entity_id: String,
    pub kind: RecordKind,
    pub reason: String,
}

/// Summary of a bootstrap run
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// Entity ids found under the root
    pub entities: usize,
    pub primary_loaded: usize,
    pub extras_loaded: usize,
    pub failed: Vec<BootstrapFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BootstrapReport {
    pub(crate) fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            entities: 0,
            primary_loaded: 0,
            extras_loaded: 0,
            failed: vec![],
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct EntityOutcome {
    primary: bool,
    extras: bool,
    failures: Vec<BootstrapFailure>,
}

/// Reads entity records from the backend into the cache store
pub struct BootstrapLoader {
    store: Arc<CacheStore>,
    backend: Arc<dyn PersistenceBackend>,
    records: Arc<RecordRegistry>,
}

impl BootstrapLoader {
    pub fn new(
        store: Arc<CacheStore>,
        backend: Arc<dyn PersistenceBackend>,
        records: Arc<RecordRegistry>,
    ) -> Self {
        Self {
            store,
            backend,
            records,
        }
    }

    /// Preload everything the plan asks for.
    ///
    /// Fails only if the plan names an unregistered kind or the root cannot
    /// be listed; per-entity problems end up in [`BootstrapReport::failed`].
    pub async fn run(&self, plan: &BootstrapPlan) -> StoreResult<BootstrapReport> {
        let started_at = Utc::now();

        self.records.layout(&plan.primary)?;
        if let Some(secondary) = &plan.secondary {
            self.records.layout(secondary)?;
        }

        let entity_ids = match self.backend.list_children(&plan.entities_root).await {
            Ok(ids) => ids,
            Err(e) if e.is_not_found() => {
                debug!("Bootstrap root {} does not exist yet", plan.entities_root);
                return Ok(BootstrapReport::empty(started_at));
            }
            Err(e) => return Err(e),
        };

        let outcomes: Vec<EntityOutcome> = stream::iter(entity_ids.iter())
            .map(|entity_id| self.load_entity(plan, entity_id))
            .buffer_unordered(plan.concurrency.max(1))
            .collect()
            .await;

        let mut report = BootstrapReport::empty(started_at);
        report.entities = entity_ids.len();
        for outcome in outcomes {
            report.primary_loaded += usize::from(outcome.primary);
            report.extras_loaded += usize::from(outcome.extras);
            report.failed.extend(outcome.failures);
        }
        report.finished_at = Utc::now();

        info!(
            entities = report.entities,
            primary_loaded = report.primary_loaded,
            extras_loaded = report.extras_loaded,
            failed = report.failed.len(),
            "Bootstrap complete"
        );
        Ok(report)
    }

    async fn load_entity(&self, plan: &BootstrapPlan, entity_id: &str) -> EntityOutcome {
        let mut outcome = EntityOutcome::default();

        let primary = match self.load_record(&plan.primary, entity_id).await {
            Ok(value) => value,
            Err(e) => {
                outcome.failures.push(self.failure(&plan.primary, entity_id, &e));
                return outcome;
            }
        };
        outcome.primary = true;

        let Some(secondary) = &plan.secondary else {
            return outcome;
        };
        if !(plan.preload_extras)(entity_id, &primary) {
            return outcome;
        }

        match self.load_record(secondary, entity_id).await {
            Ok(_) => outcome.extras = true,
            Err(e) if e.is_not_found() => {
                debug!("No {} record for {} yet", secondary, entity_id);
            }
            Err(e) => outcome.failures.push(self.failure(secondary, entity_id, &e)),
        }
        outcome
    }

    /// Read, decode and cache one record unless the key is already cached.
    ///
    /// Returns the value the cache holds afterwards.
    pub(crate) async fn load_record(&self, kind: &RecordKind, entity_id: &str) -> StoreResult<Value> {
        let layout = self.records.layout(kind)?;
        let path = layout.path(entity_id);
        let bytes = self.backend.read_raw(&path).await?;
        let value = layout.decode(&path, &bytes)?;

        // Anything cached meanwhile is newer than the disk copy
        Ok(self.store.insert_if_absent(kind.key(entity_id), value, None))
    }

    fn failure(&self, kind: &RecordKind, entity_id: &str, error: &StoreError) -> BootstrapFailure {
        warn!("Skipping {} record of entity {}: {}", kind, entity_id, error);
        BootstrapFailure {
            entity_id: entity_id.to_string(),
            kind: kind.clone(),
            reason: error.to_string(),
        }
    }
}
