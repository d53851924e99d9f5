//! Analysis cache
//!
//! Content-addressed cache for per-function LLM analysis results: the same
//! code hashed to the same key skips a repeat call. In-memory with optional
//! JSON persistence between runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::debug;

use crate::error::Result;

/// Cache key for a piece of code under a given analysis kind
pub fn cache_key_for_code(kind: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheData {
    entries: HashMap<String, Value>,
}

/// Thread-safe analysis cache
#[derive(Debug, Default)]
pub struct AnalysisCache {
    data: RwLock<CacheData>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a previously persisted cache; a missing file yields an empty
    /// cache, a corrupt one is discarded.
    pub fn load(path: &Path) -> Self {
        let data = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .ok()
            .and_then(|data| data.entries.get(key).cloned())
    }

    pub fn put(&self, key: String, value: Value) {
        if let Ok(mut data) = self.data.write() {
            data.entries.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the cache as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = self
            .data
            .read()
            .map_err(|_| crate::error::AuditError::other("cache lock poisoned"))?;
        std::fs::write(path, serde_json::to_string(&*data)?)?;
        debug!(path = %path.display(), entries = data.entries.len(), "analysis cache saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_code_same_key_different_kind_different_key() {
        let a = cache_key_for_code("scan", "fun f() {}");
        let b = cache_key_for_code("scan", "fun f() {}");
        let c = cache_key_for_code("verify", "fun f() {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = AnalysisCache::new();
        cache.put("k1".into(), serde_json::json!({"score": 7}));
        cache.save(&path).unwrap();

        let loaded = AnalysisCache::load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("k1").unwrap()["score"], 7);
    }

    #[test]
    fn missing_file_loads_empty() {
        let cache = AnalysisCache::load(Path::new("/nonexistent/cache.json"));
        assert!(cache.is_empty());
    }
}
