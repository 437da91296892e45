//! Edge Cache tier (C2): a short-lived, request-locality lookup. No
//! coalescing at this tier — that is the Unified Cache Service's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use book_core::{CacheEntry, CacheSource};

/// Recommended TTL range for edge entries (30-300s); callers pick a value
/// in this range, the cache itself does not enforce it.
pub const RECOMMENDED_MIN_TTL: Duration = Duration::from_secs(30);
pub const RECOMMENDED_MAX_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct EdgeCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl Default for EdgeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the value and its age if present and unexpired.
    pub async fn get(&self, key: &str) -> Option<(serde_json::Value, Duration)> {
        let now = Utc::now();
        let guard = self.entries.read().await;
        let entry = guard.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        let age = entry.age(now).to_std().unwrap_or(Duration::ZERO);
        Some((entry.value.clone(), age))
    }

    pub async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            source: CacheSource::Edge,
            inserted_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            headers: Default::default(),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    pub async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}
