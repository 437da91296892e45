//! Route handlers: search, batch enrichment, progress streaming, CSV
//! import, and bookshelf scanning. Each wraps the shared collaborators in
//! `AppState` with the canonical response envelope and error mapping.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Multipart, Path as AxPath, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use book_batch::{ItemOutcomeUpdate, JobHandle, LaunchOutcome, StreamAttachment};
use book_cache::{CacheResponse, CacheStatus, LoadedValue, TierSource};
use book_core::{fingerprint, BookError, CacheKind, ErrorKind, FingerprintKind, Param, ParamKind};
use book_providers::ProviderClient;
use book_stream::{MessageType, StreamMessage, StreamRegistry};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::csv;
use crate::middleware::RequestId;
use crate::{ApiEnvelope, ApiError, ApiMetadata, AppState};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn owner_principal(headers: &HeaderMap) -> String {
    bearer_token(headers).unwrap_or_else(|| "anonymous".to_string())
}

fn envelope_body<T: Serialize>(
    state: &AppState,
    request_id: &str,
    data: T,
    cache: Option<&CacheResponse>,
) -> serde_json::Value {
    let mut metadata = ApiMetadata::new(request_id.to_string());
    if let Some(cache) = cache {
        metadata.cached = matches!(cache.status, CacheStatus::Hit);
        metadata.cache_source = Some(tier_label(cache.tier).to_string());
        metadata.ttl = Some(cache.ttl_secs);
    }
    if state.config.feature.unified_envelope {
        serde_json::to_value(ApiEnvelope {
            success: true,
            data: Some(data),
            metadata,
            error: None,
        })
        .unwrap_or(serde_json::Value::Null)
    } else {
        serde_json::to_value(data).unwrap_or(serde_json::Value::Null)
    }
}

fn tier_label(tier: TierSource) -> &'static str {
    match tier {
        TierSource::Edge => "edge",
        TierSource::Kv => "kv",
        TierSource::Origin => "origin",
    }
}

/// Wraps `data` in the canonical envelope (or emits it unwrapped, per
/// `feature.unifiedEnvelope`) and, when a cache result is present, sets the
/// `x-cache-status`/`x-cache-tier`/`x-cache-ttl` headers.
fn respond<T: Serialize>(
    state: &AppState,
    request_id: &str,
    status: StatusCode,
    data: T,
    cache: Option<&CacheResponse>,
) -> Response {
    let body = envelope_body(state, request_id, data, cache);
    let mut response = (status, Json(body)).into_response();
    if let Some(cache) = cache {
        let headers = response.headers_mut();
        let status_label = if cache.status == CacheStatus::Hit { "hit" } else { "miss" };
        if let Ok(v) = HeaderValue::from_str(status_label) {
            headers.insert("x-cache-status", v);
        }
        if let Ok(v) = HeaderValue::from_str(tier_label(cache.tier)) {
            headers.insert("x-cache-tier", v);
        }
        if let Ok(v) = HeaderValue::from_str(&cache.ttl_secs.to_string()) {
            headers.insert("x-cache-ttl", v);
        }
    }
    response
}

fn validation_error(request_id: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(BookError::new(ErrorKind::ValidationError, message), request_id.to_string())
}

/// Fan out to the given providers under the cache's single-flight
/// coalescing, classifying a total provider failure as `ProviderTransient`
/// rather than an empty result set.
async fn run_search(
    state: &AppState,
    kind: CacheKind,
    fingerprint_key: String,
    providers: Vec<Arc<dyn ProviderClient>>,
    query: String,
    limit: usize,
) -> Result<CacheResponse, BookError> {
    let orchestrator = state.orchestrator;
    state
        .cache
        .get(kind, &fingerprint_key, move || async move {
            let result = orchestrator.search(providers, &query, kind, limit).await;
            if result.is_total_failure() {
                let detail = result
                    .failures
                    .iter()
                    .map(|(provider, failure)| format!("{provider:?}: {failure:?}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(BookError::new(
                    ErrorKind::ProviderTransient,
                    format!("all providers failed: {detail}"),
                ));
            }
            let quality_score = result.works.iter().map(|w| w.quality_score).max().unwrap_or(0);
            let source_provider = result.works.first().map(|w| w.primary_provider);
            let value = serde_json::json!({
                "works": result.works,
                "editions": result.editions,
                "authors": result.authors,
                "providerLabel": result.provider_label,
            });
            Ok(LoadedValue { value, quality_score, source_provider })
        })
        .await
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IsbnQuery {
    isbn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TitleQuery {
    q: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

#[derive(Deserialize)]
struct AuthorQuery {
    q: String,
}

fn default_max_results() -> usize {
    20
}

pub async fn search_isbn(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<IsbnQuery>,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    if params.isbn.trim().is_empty() {
        return Err(validation_error(&rid, "isbn must not be empty"));
    }
    let key = fingerprint(
        FingerprintKind::Search,
        "isbn",
        &[Param::new("isbn", &params.isbn, ParamKind::Isbn)],
    );
    let resp = run_search(&state, CacheKind::IsbnSearch, key, state.providers.search_set(), params.isbn, 1)
        .await
        .map_err(|e| ApiError::new(e, rid.clone()))?;
    Ok(respond(&state, &rid, StatusCode::OK, resp.value.clone(), Some(&resp)))
}

pub async fn search_title(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<TitleQuery>,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    if params.q.trim().is_empty() {
        return Err(validation_error(&rid, "q must not be empty"));
    }
    let key = fingerprint(FingerprintKind::Search, "title", &[Param::new("q", &params.q, ParamKind::Text)]);
    let resp = run_search(
        &state,
        CacheKind::TitleAuthorSearch,
        key,
        state.providers.search_set(),
        params.q,
        params.max_results,
    )
    .await
    .map_err(|e| ApiError::new(e, rid.clone()))?;
    Ok(respond(&state, &rid, StatusCode::OK, resp.value.clone(), Some(&resp)))
}

pub async fn search_author(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<AuthorQuery>,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    if params.q.trim().is_empty() {
        return Err(validation_error(&rid, "q must not be empty"));
    }
    let key = fingerprint(FingerprintKind::Search, "author", &[Param::new("q", &params.q, ParamKind::Text)]);
    let resp = run_search(
        &state,
        CacheKind::TitleAuthorSearch,
        key,
        state.providers.search_set(),
        params.q,
        default_max_results(),
    )
    .await
    .map_err(|e| ApiError::new(e, rid.clone()))?;
    Ok(respond(&state, &rid, StatusCode::OK, resp.value.clone(), Some(&resp)))
}

// ---------------------------------------------------------------------------
// Batch enrichment
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchBatchRequest {
    pub items: Vec<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchResponse {
    job_id: String,
    stream_url: String,
    auth_token: String,
    auth_token_expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<LaunchOutcome> for LaunchResponse {
    fn from(outcome: LaunchOutcome) -> Self {
        Self {
            job_id: outcome.job_id,
            stream_url: outcome.stream_url,
            auth_token: outcome.auth_token,
            auth_token_expires_at: outcome.auth_token_expires_at,
        }
    }
}

/// Derive a search key for one batch item: an `isbn` field if present,
/// otherwise a `title` field. Items with neither fail validation.
fn item_query(item: &serde_json::Value) -> Option<(CacheKind, ParamKind, &'static str, String)> {
    if let Some(isbn) = item.get("isbn").and_then(|v| v.as_str()) {
        return Some((CacheKind::IsbnSearch, ParamKind::Isbn, "isbn", isbn.to_string()));
    }
    if let Some(title) = item.get("title").and_then(|v| v.as_str()) {
        return Some((CacheKind::TitleAuthorSearch, ParamKind::Text, "title", title.to_string()));
    }
    None
}

fn extract_book_id(value: &serde_json::Value) -> Option<String> {
    value
        .get("works")
        .and_then(|w| w.as_array())
        .and_then(|arr| arr.first())
        .and_then(|work| work.get("providerIds"))
        .and_then(|ids| ids.as_object())
        .and_then(|obj| obj.values().next())
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

async fn process_batch_item(state: &AppState, item: &serde_json::Value) -> ItemOutcomeUpdate {
    let Some((kind, param_kind, subkind, query)) = item_query(item) else {
        return ItemOutcomeUpdate::Failure { error_kind: ErrorKind::ValidationError.code() };
    };
    let key = fingerprint(FingerprintKind::Search, subkind, &[Param::new("q", &query, param_kind)]);
    match run_search(state, kind, key, state.providers.search_set(), query, 1).await {
        Ok(resp) => match extract_book_id(&resp.value) {
            Some(book_id) => ItemOutcomeUpdate::Success { book_id },
            None => ItemOutcomeUpdate::Failure { error_kind: ErrorKind::NotFound.code() },
        },
        Err(err) => ItemOutcomeUpdate::Failure { error_kind: err.code() },
    }
}

/// Runs every item through the read path in its own task, reporting each
/// outcome back to the job's actor. Launch itself returns before this
/// completes; progress is observed over `/ws/progress`.
fn spawn_batch_worker(state: Arc<AppState>, handle: JobHandle, items: Vec<serde_json::Value>) {
    tokio::spawn(async move {
        for (index, item) in items.iter().enumerate() {
            let outcome = process_batch_item(&state, item).await;
            if handle.on_item_result(index, outcome).await.is_err() {
                break;
            }
        }
    });
}

pub async fn launch_batch(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<LaunchBatchRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    if body.items.is_empty() {
        return Err(validation_error(&rid, "items must not be empty"));
    }
    let owner = owner_principal(&headers);
    let outcome = state
        .batch
        .launch(owner, body.items.clone())
        .await
        .map_err(|e| ApiError::new(e, rid.clone()))?;

    if let Some(handle) = state.batch.get(&outcome.job_id) {
        spawn_batch_worker(state.clone(), handle, body.items);
    }

    Ok(respond(&state, &rid, StatusCode::CREATED, LaunchResponse::from(outcome), None))
}

pub async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    AxPath(job_id): AxPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::new(BookError::new(ErrorKind::Unauthenticated, "missing bearer token"), rid.clone()))?;
    let handle = state
        .batch
        .get(&job_id)
        .ok_or_else(|| ApiError::new(BookError::new(ErrorKind::NotFound, "job not found"), rid.clone()))?;
    handle.cancel(&token).await.map_err(|e| ApiError::new(e, rid.clone()))?;
    Ok(respond(
        &state,
        &rid,
        StatusCode::OK,
        serde_json::json!({"jobId": job_id, "status": "cancelled"}),
        None,
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub job_id: String,
    pub token: String,
}

pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<RefreshRequest>,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    let handle = state
        .batch
        .get(&body.job_id)
        .ok_or_else(|| ApiError::new(BookError::new(ErrorKind::NotFound, "job not found"), rid.clone()))?;
    let envelope = handle.refresh_token(&body.token).await.map_err(|e| ApiError::new(e, rid.clone()))?;
    let data = serde_json::json!({
        "token": envelope.auth_token,
        "expiresAt": envelope.auth_token_expires_at,
    });
    Ok(respond(&state, &rid, StatusCode::OK, data, None))
}

// ---------------------------------------------------------------------------
// Progress stream
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressQuery {
    job_id: String,
    #[serde(default)]
    last_seq: u64,
}

pub async fn progress_ws(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProgressQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let rid = uuid::Uuid::new_v4().to_string();
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::new(BookError::new(ErrorKind::Unauthenticated, "missing bearer token"), rid.clone()))?;
    let handle = state
        .batch
        .get(&params.job_id)
        .ok_or_else(|| ApiError::new(BookError::new(ErrorKind::NotFound, "job not found"), rid.clone()))?;
    let attachment = handle
        .attach_stream(&token, params.last_seq)
        .await
        .map_err(|e| ApiError::new(e, rid.clone()))?;

    let job_id = params.job_id.clone();
    let streams = state.batch.streams().clone();
    Ok(ws.on_upgrade(move |socket| handle_progress_socket(socket, attachment, job_id, streams)))
}

async fn send_message(sender: &mut SplitSink<WebSocket, Message>, message: &StreamMessage) -> bool {
    let payload = serde_json::to_string(message).unwrap_or_default();
    sender.send(Message::Text(payload.into())).await.is_ok()
}

fn detach(streams: &StreamRegistry, job_id: &str) {
    if let Some(stream) = streams.get(job_id) {
        stream.detach();
    }
}

fn is_terminal(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::Completed | MessageType::Failed | MessageType::Partial | MessageType::Cancelled
    )
}

async fn handle_progress_socket(
    socket: WebSocket,
    attachment: StreamAttachment,
    job_id: String,
    streams: StreamRegistry,
) {
    let (mut sender, mut receiver) = socket.split();
    let StreamAttachment { replay, receiver: mut updates } = attachment;

    for message in &replay {
        if !send_message(&mut sender, message).await {
            detach(&streams, &job_id);
            return;
        }
    }

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Binary(_) => continue,
            }
        }
    });

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(message) => {
                        let terminal = is_terminal(message.message_type);
                        if !send_message(&mut sender, &message).await || terminal {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = &mut recv_task => break,
        }
    }

    recv_task.abort();
    detach(&streams, &job_id);
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

pub async fn import_csv(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    if body.len() as u64 > book_config::MAX_CSV_IMPORT_BYTES {
        return Err(ApiError::new(
            BookError::new(ErrorKind::PayloadTooLarge, "csv import exceeds the 10 MiB limit"),
            rid,
        ));
    }
    let text = std::str::from_utf8(&body)
        .map_err(|_| validation_error(&rid, "csv body is not valid utf-8"))?;
    let rows = csv::parse_rows(text).map_err(|e| validation_error(&rid, e))?;
    if rows.is_empty() {
        return Err(validation_error(&rid, "csv import contains no data rows"));
    }
    let owner = owner_principal(&headers);
    let outcome = state.batch.launch(owner, rows.clone()).await.map_err(|e| ApiError::new(e, rid.clone()))?;
    if let Some(handle) = state.batch.get(&outcome.job_id) {
        spawn_batch_worker(state.clone(), handle, rows);
    }
    Ok(respond(&state, &rid, StatusCode::CREATED, LaunchResponse::from(outcome), None))
}

// ---------------------------------------------------------------------------
// Bookshelf scan
// ---------------------------------------------------------------------------

pub async fn scan_bookshelf(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let rid = request_id.to_string();
    let mut image_count = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| validation_error(&rid, e.to_string()))?
    {
        let _bytes = field.bytes().await.map_err(|e| validation_error(&rid, e.to_string()))?;
        image_count += 1;
    }
    if image_count == 0 {
        return Err(validation_error(&rid, "no images in multipart body"));
    }

    let query = format!("bookshelf-scan:{image_count}-images");
    let key = fingerprint(FingerprintKind::Ai, "bookshelf", &[Param::new("q", &query, ParamKind::Text)]);
    let providers: Vec<Arc<dyn ProviderClient>> = vec![state.providers.ai_vision.clone()];
    let resp = run_search(&state, CacheKind::AiParse, key, providers, query, 20)
        .await
        .map_err(|e| ApiError::new(e, rid.clone()))?;
    Ok(respond(&state, &rid, StatusCode::OK, resp.value.clone(), Some(&resp)))
}
