//! Unified Cache Service (C4): two-tier read-through with single-flight
//! coalescing, write-back, and header/metric emission.
//!
//! The coalescing map follows the same shape as a multi-tier cache
//! manager's in-flight map: a concurrent map from fingerprint to a shared
//! cell, with a reference-counted [`CoalesceGuard`] that removes the entry
//! once the last waiter has observed the outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use book_config::CacheTtlTable;
use book_core::{BookError, CacheKind, ProviderName};
use book_telemetry::{Event, MetricsCollector};

use crate::edge::EdgeCache;
use crate::kv::{KvBackend, KvMetadata};

/// Value produced by a loader on a cache miss.
#[derive(Debug, Clone)]
pub struct LoadedValue {
    pub value: serde_json::Value,
    pub quality_score: u8,
    pub source_provider: Option<ProviderName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSource {
    Edge,
    Kv,
    Origin,
}

/// The observable headers/metadata returned alongside a cached value.
#[derive(Debug, Clone)]
pub struct CacheResponse {
    pub value: serde_json::Value,
    pub status: CacheStatus,
    pub tier: TierSource,
    pub ttl_secs: u64,
    pub completeness_pct: u8,
    pub image_quality_flag: bool,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct UnifiedCacheConfig {
    /// Entries scoring below this floor are not written back.
    pub quality_floor: u8,
    /// Negative caching for hard not-found signals. `None` by default
    /// (reference behavior is not to cache negatives); when set, must be
    /// at most 60s.
    pub negative_cache_ttl: Option<Duration>,
    /// TTL used when repopulating the edge tier after a KV or origin hit.
    pub edge_repopulate_ttl: Duration,
}

impl Default for UnifiedCacheConfig {
    fn default() -> Self {
        Self {
            quality_floor: 0,
            negative_cache_ttl: None,
            edge_repopulate_ttl: Duration::from_secs(60),
        }
    }
}

type LoadOutcome = Result<LoadedValue, BookError>;

struct InFlightEntry {
    cell: OnceCell<LoadOutcome>,
    refcount: AtomicUsize,
}

/// Removes this fingerprint's in-flight entry once the last coalesced
/// caller has read the outcome.
struct CoalesceGuard<'a> {
    map: &'a DashMap<String, Arc<InFlightEntry>>,
    key: String,
    entry: Arc<InFlightEntry>,
}

impl Drop for CoalesceGuard<'_> {
    fn drop(&mut self) {
        if self.entry.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.map.remove_if(&self.key, |_, v| Arc::ptr_eq(v, &self.entry));
        }
    }
}

pub struct UnifiedCache {
    edge: EdgeCache,
    kv: Arc<dyn KvBackend>,
    ttl_table: CacheTtlTable,
    config: UnifiedCacheConfig,
    metrics: MetricsCollector,
    inflight: Arc<DashMap<String, Arc<InFlightEntry>>>,
    negatives: Arc<DashMap<String, Instant>>,
}

impl UnifiedCache {
    pub fn new(
        edge: EdgeCache,
        kv: Arc<dyn KvBackend>,
        ttl_table: CacheTtlTable,
        config: UnifiedCacheConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            edge,
            kv,
            ttl_table,
            config,
            metrics,
            inflight: Arc::new(DashMap::new()),
            negatives: Arc::new(DashMap::new()),
        }
    }

    /// Two-tier read-through with coalescing. `loader` runs at most once
    /// per fingerprint across all concurrent callers.
    pub async fn get<F, Fut>(
        &self,
        kind: CacheKind,
        fingerprint: &str,
        loader: F,
    ) -> Result<CacheResponse, BookError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = LoadOutcome> + Send + 'static,
    {
        let start = Instant::now();

        if let Some((value, _age)) = self.edge.get(fingerprint).await {
            self.metrics.record(
                Event::CacheHit {
                    tier: "edge".to_string(),
                    fingerprint: fingerprint.to_string(),
                },
                Utc::now(),
            );
            return Ok(self.respond(value.clone(), CacheStatus::Hit, TierSource::Edge, kind, &value, start));
        }

        if let Some((value, meta, _age)) = self.kv.get(fingerprint).await {
            self.edge
                .put(fingerprint, value.clone(), self.config.edge_repopulate_ttl)
                .await;
            self.metrics.record(
                Event::CacheHit {
                    tier: "kv".to_string(),
                    fingerprint: fingerprint.to_string(),
                },
                Utc::now(),
            );
            let mut resp = self.respond(value.clone(), CacheStatus::Hit, TierSource::Kv, kind, &value, start);
            resp.completeness_pct = meta.quality_score;
            return Ok(resp);
        }

        if let Some(ttl) = self.config.negative_cache_ttl {
            if let Some(marked) = self.negatives.get(fingerprint) {
                if marked.elapsed() < ttl {
                    self.metrics.record(
                        Event::CacheMiss {
                            fingerprint: fingerprint.to_string(),
                        },
                        Utc::now(),
                    );
                    return Err(BookError::new(
                        book_core::ErrorKind::NotFound,
                        "cached not-found",
                    ));
                }
            }
        }

        let entry = self
            .inflight
            .entry(fingerprint.to_string())
            .or_insert_with(|| {
                Arc::new(InFlightEntry {
                    cell: OnceCell::new(),
                    refcount: AtomicUsize::new(0),
                })
            })
            .clone();
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        let waiters_before = entry.refcount.load(Ordering::Acquire);
        if waiters_before > 1 {
            self.metrics.record(
                Event::CacheCoalesced {
                    fingerprint: fingerprint.to_string(),
                    waiters: waiters_before as u32,
                },
                Utc::now(),
            );
        }
        let guard = CoalesceGuard {
            map: &self.inflight,
            key: fingerprint.to_string(),
            entry: entry.clone(),
        };

        let outcome = entry.cell.get_or_init(loader).await.clone();
        drop(guard);

        match outcome {
            Ok(loaded) => {
                if loaded.quality_score >= self.config.quality_floor {
                    let ttl = self.ttl_table.ttl_for(kind);
                    self.kv
                        .put(
                            fingerprint,
                            loaded.value.clone(),
                            ttl,
                            KvMetadata {
                                source_provider: loaded.source_provider,
                                quality_score: loaded.quality_score,
                            },
                        )
                        .await;
                    self.edge
                        .put(fingerprint, loaded.value.clone(), self.config.edge_repopulate_ttl)
                        .await;
                }
                self.metrics.record(
                    Event::CacheMiss {
                        fingerprint: fingerprint.to_string(),
                    },
                    Utc::now(),
                );
                let mut resp = self.respond(
                    loaded.value.clone(),
                    CacheStatus::Miss,
                    TierSource::Origin,
                    kind,
                    &loaded.value,
                    start,
                );
                resp.completeness_pct = loaded.quality_score;
                Ok(resp)
            }
            Err(err) => {
                if let Some(_ttl) = self.config.negative_cache_ttl {
                    self.negatives.insert(fingerprint.to_string(), Instant::now());
                }
                Err(err)
            }
        }
    }

    fn respond(
        &self,
        value: serde_json::Value,
        status: CacheStatus,
        tier: TierSource,
        kind: CacheKind,
        raw: &serde_json::Value,
        start: Instant,
    ) -> CacheResponse {
        CacheResponse {
            value,
            status,
            tier,
            ttl_secs: self.ttl_table.ttl_for(kind).as_secs(),
            completeness_pct: 100,
            image_quality_flag: has_cover_image(raw),
            response_time_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn has_cover_image(value: &serde_json::Value) -> bool {
    value
        .get("coverImageURL")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false)
}
