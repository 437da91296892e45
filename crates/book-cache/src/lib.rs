//! Tiered cache and request-coalescing layer in front of the upstream
//! providers: Edge Cache (C2), KV Cache (C3), and the Unified Cache
//! Service (C4) that composes them.

pub mod edge;
pub mod kv;
pub mod unified;

pub use edge::EdgeCache;
pub use kv::{InMemoryKvBackend, KvBackend, KvMetadata};
pub use unified::{
    CacheResponse, CacheStatus, LoadedValue, TierSource, UnifiedCache, UnifiedCacheConfig,
};
