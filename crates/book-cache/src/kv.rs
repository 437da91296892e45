//! KV Cache tier (C3): a durable, namespaced key/value store. Writes
//! fail-open — a write error must never fail the read path that triggered
//! it (see [`KvBackend::put`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use book_core::{CacheEntry, CacheSource, ProviderName};

/// Metadata carried alongside a KV value: which provider produced it and
/// how complete it was judged to be.
#[derive(Debug, Clone)]
pub struct KvMetadata {
    pub source_provider: Option<ProviderName>,
    pub quality_score: u8,
}

/// Pluggable KV backend. `book-daemon` wires an [`InMemoryKvBackend`]; a
/// production deployment would implement this against a real durable
/// store without changing any caller of [`crate::unified::UnifiedCache`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<(serde_json::Value, KvMetadata, Duration)>;
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration, metadata: KvMetadata);
    async fn delete(&self, key: &str);
}

/// Process-local KV backend. Not durable across restarts, but implements
/// the same contract a durable backend would.
#[derive(Clone, Default)]
pub struct InMemoryKvBackend {
    entries: Arc<RwLock<HashMap<String, (CacheEntry, KvMetadata)>>>,
}

impl InMemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKvBackend {
    async fn get(&self, key: &str) -> Option<(serde_json::Value, KvMetadata, Duration)> {
        let now = Utc::now();
        let guard = self.entries.read().await;
        let (entry, metadata) = guard.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        let age = entry.age(now).to_std().unwrap_or(Duration::ZERO);
        Some((entry.value.clone(), metadata.clone(), age))
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration, metadata: KvMetadata) {
        let entry = CacheEntry {
            value,
            source: CacheSource::Kv,
            inserted_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            headers: Default::default(),
        };
        // In-memory writes cannot fail; a real backend's `put` should
        // swallow its own errors here too, per the fail-open contract.
        self.entries.write().await.insert(key.to_string(), (entry, metadata));
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}
