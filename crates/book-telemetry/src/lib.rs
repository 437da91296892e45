//! Structured event emission and metrics summaries. Never on the request
//! critical path: [`MetricsCollector::record`] only takes a short-lived
//! lock and callers are expected to fire-and-forget.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded event: a cache outcome, provider call, or job transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Event {
    CacheHit { tier: String, fingerprint: String },
    CacheMiss { fingerprint: String },
    CacheCoalesced { fingerprint: String, waiters: u32 },
    ProviderLatency { provider: String, millis: u64, success: bool },
    JobTransition { job_id: String, from: String, to: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event: Event,
    pub at: DateTime<Utc>,
}

/// Linear-interpolation percentile over a pre-sorted slice.
pub fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo] as f64;
    }
    let frac = rank - lo as f64;
    sorted[lo] as f64 * (1.0 - frac) + sorted[hi] as f64 * frac
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_events: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_coalesced: usize,
    pub provider_calls: usize,
    pub provider_failures: usize,
    pub provider_latency_p50_ms: f64,
    pub provider_latency_p99_ms: f64,
}

/// In-memory collector of recorded events, behind a short-held lock.
#[derive(Clone)]
pub struct MetricsCollector {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record an event. Emits a `tracing` event as well; failure to record
    /// (a poisoned lock) is swallowed rather than propagated.
    pub fn record(&self, event: Event, at: DateTime<Utc>) {
        tracing::debug!(?event, "telemetry event");
        if let Ok(mut guard) = self.events.lock() {
            guard.push(RecordedEvent { event, at });
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.events.lock() {
            guard.clear();
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn summary(&self) -> MetricsSummary {
        let events = self.events();
        let mut summary = MetricsSummary {
            total_events: events.len(),
            ..Default::default()
        };
        let mut latencies: Vec<u64> = Vec::new();
        for recorded in &events {
            match &recorded.event {
                Event::CacheHit { .. } => summary.cache_hits += 1,
                Event::CacheMiss { .. } => summary.cache_misses += 1,
                Event::CacheCoalesced { .. } => summary.cache_coalesced += 1,
                Event::ProviderLatency { millis, success, .. } => {
                    summary.provider_calls += 1;
                    if !success {
                        summary.provider_failures += 1;
                    }
                    latencies.push(*millis);
                }
                Event::JobTransition { .. } => {}
            }
        }
        latencies.sort_unstable();
        summary.provider_latency_p50_ms = percentile(&latencies, 50.0);
        summary.provider_latency_p99_ms = percentile(&latencies, 99.0);
        summary
    }
}

/// Pluggable export sink for an accumulated [`MetricsSummary`].
pub trait TelemetryExporter: Send + Sync {
    fn export(&self, summary: &MetricsSummary) -> Result<(), String>;
}

/// Exports a summary as pretty JSON to the given writer.
pub struct JsonExporter;

impl TelemetryExporter for JsonExporter {
    fn export(&self, summary: &MetricsSummary) -> Result<(), String> {
        let json = serde_json::to_string_pretty(summary).map_err(|e| e.to_string())?;
        tracing::info!(%json, "telemetry summary exported");
        Ok(())
    }
}
