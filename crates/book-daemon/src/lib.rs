//! The HTTP control-plane binary: search, batch enrichment, progress
//! streaming, CSV import, and bookshelf scanning, wired over the
//! cache/provider/orchestrator/batch/rate-limit crates into one
//! `axum::Router`.

pub mod csv;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use book_batch::JobRegistry;
use book_cache::UnifiedCache;
use book_config::BookConfig;
use book_core::BookError;
use book_orchestrator::Orchestrator;
use book_providers::ProviderClient;
use book_ratelimit::{RateLimitKey, RateLimiter, RateLimiterLayer};
use book_telemetry::MetricsCollector;
use chrono::Utc;
use serde::Serialize;

use middleware::CorsConfig;

/// The four upstream providers the daemon talks to, bundled so `AppState`
/// can hand the orchestrator exactly the subset a given query kind needs.
#[derive(Clone)]
pub struct ProviderSet {
    pub primary: Arc<dyn ProviderClient>,
    pub secondary: Arc<dyn ProviderClient>,
    pub cover: Arc<dyn ProviderClient>,
    pub ai_vision: Arc<dyn ProviderClient>,
}

impl ProviderSet {
    /// Providers fanned out to for ISBN/title/author search.
    pub fn search_set(&self) -> Vec<Arc<dyn ProviderClient>> {
        vec![self.primary.clone(), self.secondary.clone()]
    }
}

pub struct AppState {
    pub cache: UnifiedCache,
    pub providers: ProviderSet,
    pub orchestrator: Orchestrator,
    pub batch: JobRegistry,
    pub rate_limiter: RateLimiter,
    pub config: BookConfig,
    pub metrics: MetricsCollector,
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// `{success, data, metadata:{source, timestamp, cached, cacheSource?,
/// ttl?, requestId}, error?}`, the canonical response shape. Disabled by
/// `feature.unifiedEnvelope=false`, in which case handlers emit `data`
/// (or the error body) unwrapped.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMetadata {
    pub source: String,
    pub timestamp: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub request_id: String,
}

impl ApiMetadata {
    pub fn new(request_id: String) -> Self {
        Self {
            source: "book-daemon".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            cached: false,
            cache_source: None,
            ttl: None,
            request_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub kind: book_core::ErrorKind,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub metadata: ApiMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// A realized `BookError` paired with the inbound request's id, so the
/// `IntoResponse` impl can set `X-Request-Id` on error paths too.
#[derive(Debug)]
pub struct ApiError {
    pub error: BookError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: BookError, request_id: String) -> Self {
        Self { error, request_id }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::{HeaderValue, StatusCode};
        use axum::response::IntoResponse;
        use axum::Json;

        let status = self
            .error
            .http_status()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = ApiEnvelope::<serde_json::Value> {
            success: false,
            data: None,
            metadata: ApiMetadata::new(self.request_id.clone()),
            error: Some(ErrorBody {
                code: self.error.code(),
                kind: self.error.kind,
                message: self.error.message.clone(),
            }),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&self.request_id) {
            headers.insert("x-request-id", v);
        }
        if let Some(retry_after) = self.error.context.get("retryAfterSecs") {
            if let Ok(v) = HeaderValue::from_str(retry_after) {
                headers.insert("retry-after", v);
            }
        }
        response
    }
}

fn rate_limit_key_extractor(req: &axum::extract::Request) -> RateLimitKey {
    let principal = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").to_string())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());
    RateLimitKey::new(principal, endpoint_class(req.uri().path()))
}

fn endpoint_class(path: &str) -> &'static str {
    if path.starts_with("/v1/batch-enrichment") || path.starts_with("/api/token/refresh") {
        "batch"
    } else if path.starts_with("/v1/search") {
        "search"
    } else if path.starts_with("/ws/progress") {
        "stream"
    } else if path.starts_with("/v1/books/import") {
        "import"
    } else if path.starts_with("/v1/bookshelf") {
        "scan"
    } else {
        "default"
    }
}

/// Build the Axum router with every route in the external-interface
/// contract, wrapped with request-id, logging, rate-limit, and CORS
/// middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let rate_limiter_layer = RateLimiterLayer::new(state.rate_limiter.clone(), rate_limit_key_extractor);

    Router::new()
        .route("/v1/search/isbn", get(handlers::search_isbn))
        .route("/v1/search/title", get(handlers::search_title))
        .route("/v1/search/author", get(handlers::search_author))
        .route("/v1/batch-enrichment", post(handlers::launch_batch))
        .route(
            "/v1/batch-enrichment/{job_id}/cancel",
            post(handlers::cancel_batch),
        )
        .route("/api/token/refresh", post(handlers::refresh_token))
        .route("/ws/progress", get(handlers::progress_ws))
        .route("/v1/books/import/csv", post(handlers::import_csv))
        .route("/v1/bookshelf/scan", post(handlers::scan_bookshelf))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::RequestLogger::layer))
        .layer(rate_limiter_layer)
        .layer(CorsConfig::default().to_cors_layer())
        .with_state(state)
}
