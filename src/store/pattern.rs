//! Glob-style key patterns (`*` is the only wildcard)

use crate::error::{StoreError, StoreResult};
use regex::Regex;

/// Compiled key pattern such as `computed:E1:*`
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> StoreResult<Self> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        // `(?s)` so `*` also spans newlines inside keys
        let regex = Regex::new(&format!("(?s)^{}$", body)).map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            source: e,
        })?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
