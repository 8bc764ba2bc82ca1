//! Record kinds and their on-disk layout
//!
//! A [`RecordKind`] names one kind of per-entity record (`config`, `ratings`,
//! ...). Its [`RecordLayout`] decides where the record lives in the backend
//! and how a cached value is turned into bytes and back. The cache itself
//! never picks a wire format.

use crate::error::{StoreError, StoreResult};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Caller-defined tag for a kind of per-entity record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKind(Cow<'static, str>);

impl RecordKind {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical cache key for this kind of record of `entity_id`
    pub fn key(&self, entity_id: &str) -> String {
        format!("{}:{}", self.0, entity_id)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for RecordKind {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

/// Where a record lives and how it is (de)serialized
pub trait RecordLayout: Send + Sync {
    /// Backend path of this record for `entity_id`
    fn path(&self, entity_id: &str) -> String;

    /// Serialize a cached value into the bytes to persist
    fn encode(&self, value: &Value) -> StoreResult<Vec<u8>>;

    /// Parse persisted bytes; `path` is only used for error reporting
    fn decode(&self, path: &str, bytes: &[u8]) -> StoreResult<Value>;
}

/// Expand `{id}` in a path template
fn render(template: &str, entity_id: &str) -> String {
    template.replace("{id}", entity_id)
}

/// A single JSON document, e.g. `events/{id}/config.json`
#[derive(Debug, Clone)]
pub struct JsonRecord {
    template: String,
}

impl JsonRecord {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl RecordLayout for JsonRecord {
    fn path(&self, entity_id: &str) -> String {
        render(&self.template, entity_id)
    }

    fn encode(&self, value: &Value) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn decode(&self, path: &str, bytes: &[u8]) -> StoreResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::corrupt(path, e))
    }
}

/// An append-like dataset stored as one JSON value per line.
///
/// Cached as a JSON array; blank lines are ignored on decode.
#[derive(Debug, Clone)]
pub struct JsonLinesRecord {
    template: String,
}

impl JsonLinesRecord {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl RecordLayout for JsonLinesRecord {
    fn path(&self, entity_id: &str) -> String {
        render(&self.template, entity_id)
    }

    fn encode(&self, value: &Value) -> StoreResult<Vec<u8>> {
        let rows = value.as_array().ok_or_else(|| {
            StoreError::Internal("JSON lines records must be cached as arrays".to_string())
        })?;

        let mut out = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut out, row)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn decode(&self, path: &str, bytes: &[u8]) -> StoreResult<Value> {
        let text = std::str::from_utf8(bytes).map_err(|e| StoreError::corrupt(path, e))?;

        let rows = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .map_err(|e| StoreError::corrupt(path, format!("line {}: {}", n + 1, e)))
            })
            .collect::<StoreResult<Vec<Value>>>()?;

        Ok(Value::Array(rows))
    }
}

/// Layouts registered per record kind
#[derive(Clone, Default)]
pub struct RecordRegistry {
    layouts: HashMap<RecordKind, Arc<dyn RecordLayout>>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the layout for `kind`
    pub fn register(mut self, kind: impl Into<RecordKind>, layout: impl RecordLayout + 'static) -> Self {
        self.layouts.insert(kind.into(), Arc::new(layout));
        self
    }

    /// Look up the layout for `kind`
    pub fn layout(&self, kind: &RecordKind) -> StoreResult<&Arc<dyn RecordLayout>> {
        self.layouts
            .get(kind)
            .ok_or_else(|| StoreError::UnknownRecordKind(kind.to_string()))
    }

    /// Backend path for a record, if the kind is registered
    pub fn path(&self, kind: &RecordKind, entity_id: &str) -> StoreResult<String> {
        Ok(self.layout(kind)?.path(entity_id))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &RecordKind> {
        self.layouts.keys()
    }
}

impl fmt::Debug for RecordRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordRegistry")
            .field("kinds", &self.layouts.keys().collect::<Vec<_>>())
            .finish()
    }
}
