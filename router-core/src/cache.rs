//! # Keyword Cache
//!
//! The last known value of every keyword the router has seen, with an age
//! (for the START/load3 grace-window rule in the Rule Engine) and best-effort
//! JSON persistence across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheValue {
    Int(i64),
    Text(String),
}

impl CacheValue {
    pub fn as_str(&self) -> String {
        match self {
            CacheValue::Int(v) => v.to_string(),
            CacheValue::Text(v) => v.clone(),
        }
    }
}

struct Entry {
    value: CacheValue,
    updated: Instant,
}

/// Envelope persisted to disk; the explicit `version` field lets a future
/// format change reject an older cache file outright instead of guessing.
#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: HashMap<String, PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    value: CacheValue,
}

const CACHE_FORMAT_VERSION: u32 = 1;

/// A typed last-value store for PSX network variables.
pub struct Cache {
    entries: HashMap<String, Entry>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn has(&self, keyword: &str) -> bool {
        self.entries.contains_key(keyword)
    }

    pub fn get_value(&self, keyword: &str) -> Result<&CacheValue, CacheError> {
        self.entries
            .get(keyword)
            .map(|e| &e.value)
            .ok_or_else(|| CacheError::Uncached(keyword.to_string()))
    }

    pub fn get_age(&self, keyword: &str) -> Result<std::time::Duration, CacheError> {
        self.entries
            .get(keyword)
            .map(|e| e.updated.elapsed())
            .ok_or_else(|| CacheError::Uncached(keyword.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Update a variable in the cache, coercing its textual form into the
    /// type the keyword prefix implies: `Qi`/`Qh` keywords are integers,
    /// everything else is stored verbatim as text.
    pub fn update(&mut self, keyword: &str, value: &str) -> Result<(), CacheError> {
        let value = if matches!(&keyword[..keyword.len().min(2)], "Qi" | "Qh") {
            let parsed: i64 = value
                .parse()
                .map_err(|_| CacheError::WrongType {
                    keyword: keyword.to_string(),
                    value: value.to_string(),
                })?;
            CacheValue::Int(parsed)
        } else {
            CacheValue::Text(value.to_string())
        };
        self.entries.insert(
            keyword.to_string(),
            Entry {
                value,
                updated: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn write_to_file(&self, path: &Path) -> anyhow::Result<()> {
        if self.entries.is_empty() {
            tracing::info!("not writing empty cache to disk");
            return Ok(());
        }
        let persisted = PersistedCache {
            version: CACHE_FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        PersistedEntry {
                            value: v.value.clone(),
                        },
                    )
                })
                .collect(),
        };
        let data = serde_json::to_string(&persisted)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load cached state from a prior run. Any failure (missing file,
    /// corrupt JSON, unrecognized version) is non-fatal: the router starts
    /// with an empty cache and reconnecting clients will repopulate it.
    pub fn read_from_file(path: &Path) -> Self {
        let mut cache = Self::new();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(_) => {
                tracing::warn!(
                    "failed to load state cache from {}, starting empty",
                    path.display()
                );
                return cache;
            }
        };
        let persisted: PersistedCache = match serde_json::from_str(&data) {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!("bad data in {}, starting with empty cache", path.display());
                return cache;
            }
        };
        if persisted.version != CACHE_FORMAT_VERSION {
            tracing::warn!("cache file is an unsupported format, starting with empty cache");
            return cache;
        }
        for (k, v) in persisted.entries {
            cache.entries.insert(
                k,
                Entry {
                    value: v.value,
                    updated: Instant::now(),
                },
            );
        }
        cache
    }
}
