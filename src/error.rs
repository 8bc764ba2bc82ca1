//! Error types for warmstore
//!
//! All modules use `StoreResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for warmstore operations
pub type StoreResult<T> = Result<T, StoreError>;

/// All errors that can occur in warmstore
#[derive(Error, Debug)]
pub enum StoreError {
    // Persistence errors
    #[error("Record not found: {path}")]
    NotFound { path: String },

    #[error("Corrupt record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown record kind: {0}")]
    UnknownRecordKind(String),

    // Lock errors
    #[error("Timed out after {waited:?} waiting for lock on entity {entity_id}")]
    LockTimeout { entity_id: String, waited: Duration },

    // Cache errors
    #[error("Invalid key pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a not-found error for a backend path
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a corrupt record error
    pub fn corrupt(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::CorruptRecord {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if the backend reported a missing record
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::LockTimeout { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownRecordKind(_) => Some("Register a layout for this kind in the RecordRegistry"),
            Self::LockTimeout { .. } => {
                Some("A lock holder may have leaked its guard; check for guards held across long awaits")
            }
            Self::InvalidPattern { .. } => Some("Patterns support only the `*` wildcard"),
            _ => None,
        }
    }
}
