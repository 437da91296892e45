//! Handler-level tests for the REST surface: search, batch launch/cancel/
//! refresh, CSV import, and bookshelf scan.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use book_batch::{FileJobStore, JobRegistry, JobStore};
use book_cache::{EdgeCache, InMemoryKvBackend, UnifiedCache, UnifiedCacheConfig};
use book_config::BookConfig;
use book_core::ProviderName;
use book_daemon::{build_app, AppState, ProviderSet};
use book_orchestrator::Orchestrator;
use book_providers::{MockProviderClient, ProviderClient, ProviderFailure, RawRecord};
use book_ratelimit::RateLimiter;
use book_stream::StreamRegistry;
use book_telemetry::MetricsCollector;
use http_body_util::BodyExt;

fn ok_record(title: &str) -> RawRecord {
    RawRecord {
        provider: ProviderName::Primary,
        payload: serde_json::json!({
            "id": "w1",
            "title": title,
            "isbn": "9780140449136",
            "authors": ["Homer"],
        }),
    }
}

fn mock_client(search_result: Result<Vec<RawRecord>, ProviderFailure>) -> Arc<dyn ProviderClient> {
    Arc::new(MockProviderClient {
        name: ProviderName::Primary,
        search_result,
        lookup_result: Err(ProviderFailure::NotFound),
    })
}

fn test_state(data_dir: &std::path::Path, search_result: Result<Vec<RawRecord>, ProviderFailure>) -> Arc<AppState> {
    let providers = ProviderSet {
        primary: mock_client(search_result.clone()),
        secondary: mock_client(search_result.clone()),
        cover: mock_client(search_result.clone()),
        ai_vision: mock_client(search_result),
    };

    let cache = UnifiedCache::new(
        EdgeCache::new(),
        Arc::new(InMemoryKvBackend::new()),
        BookConfig::default().cache,
        UnifiedCacheConfig::default(),
        MetricsCollector::new(),
    );

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(data_dir.to_path_buf()));
    let batch = JobRegistry::new(store, StreamRegistry::new(), BookConfig::default().batch);

    Arc::new(AppState {
        cache,
        providers,
        orchestrator: Orchestrator::default(),
        batch,
        rate_limiter: RateLimiter::new(1000, Duration::from_secs(60)),
        config: BookConfig::default(),
        metrics: MetricsCollector::new(),
    })
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

async fn post_json(app: axum::Router, uri: &str, body: &serde_json::Value) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .header("authorization", "Bearer test-owner")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_isbn_returns_works() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("The Odyssey")]));
    let app = build_app(state);

    let (status, json) = get_json(app, "/v1/search/isbn?isbn=9780140449136").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["works"][0]["title"], "The Odyssey");
}

#[tokio::test]
async fn search_isbn_missing_param_is_validation_error() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("x")]));
    let app = build_app(state);

    let resp = app
        .oneshot(Request::builder().uri("/v1/search/isbn?isbn=").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_title_respects_max_results_default() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Dune")]));
    let app = build_app(state);

    let (status, json) = get_json(app, "/v1/search/title?q=dune").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["works"][0]["title"], "Dune");
}

#[tokio::test]
async fn search_author_empty_query_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("x")]));
    let app = build_app(state);

    let (status, _) = get_json(app, "/v1/search/author?q=%20").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_isbn_all_providers_failing_is_provider_error() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Err(ProviderFailure::Timeout));
    let app = build_app(state);

    let (status, json) = get_json(app, "/v1/search/isbn?isbn=9780140449136").await;
    assert!(status.is_client_error() || status.is_server_error(), "expected error status, got {status}: {json}");
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn search_isbn_cache_hits_on_second_call() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Cached Book")]));

    let app1 = build_app(state.clone());
    let (status1, json1) = get_json(app1, "/v1/search/isbn?isbn=9780140449136").await;
    assert_eq!(status1, StatusCode::OK);
    assert_eq!(json1["metadata"]["cached"], false);

    let app2 = build_app(state);
    let (status2, json2) = get_json(app2, "/v1/search/isbn?isbn=9780140449136").await;
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(json2["metadata"]["cached"], true);
}

// ---------------------------------------------------------------------------
// Batch enrichment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn launch_batch_returns_stream_url_and_token() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Moby Dick")]));
    let app = build_app(state);

    let body = serde_json::json!({"items": [{"isbn": "9780140449136"}]});
    let (status, json) = post_json(app, "/v1/batch-enrichment", &body).await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(json["data"]["jobId"].is_string());
    assert!(json["data"]["streamUrl"].as_str().unwrap().contains(json["data"]["jobId"].as_str().unwrap()));
    assert!(json["data"]["authToken"].is_string());
}

#[tokio::test]
async fn launch_batch_rejects_empty_items() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("x")]));
    let app = build_app(state);

    let body = serde_json::json!({"items": []});
    let (status, _) = post_json(app, "/v1/batch-enrichment", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_batch_with_valid_token_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Moby Dick")]));
    let app = build_app(state.clone());

    let body = serde_json::json!({"items": [{"isbn": "9780140449136"}]});
    let (_, launch) = post_json(app, "/v1/batch-enrichment", &body).await;
    let job_id = launch["data"]["jobId"].as_str().unwrap().to_string();
    let token = launch["data"]["authToken"].as_str().unwrap().to_string();

    let app2 = build_app(state);
    let resp = app2
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/batch-enrichment/{job_id}/cancel"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn cancel_batch_with_wrong_token_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Moby Dick")]));
    let app = build_app(state.clone());

    let body = serde_json::json!({"items": [{"isbn": "9780140449136"}]});
    let (_, launch) = post_json(app, "/v1/batch-enrichment", &body).await;
    let job_id = launch["data"]["jobId"].as_str().unwrap().to_string();

    let app2 = build_app(state);
    let resp = app2
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/batch-enrichment/{job_id}/cancel"))
                .header("authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn cancel_unknown_job_returns_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("x")]));
    let app = build_app(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/batch-enrichment/does-not-exist/cancel")
                .header("authorization", "Bearer whatever")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn refresh_token_with_valid_token_rotates() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Moby Dick")]));
    let app = build_app(state.clone());

    let body = serde_json::json!({"items": [{"isbn": "9780140449136"}]});
    let (_, launch) = post_json(app, "/v1/batch-enrichment", &body).await;
    let job_id = launch["data"]["jobId"].as_str().unwrap().to_string();
    let token = launch["data"]["authToken"].as_str().unwrap().to_string();

    let app2 = build_app(state);
    let refresh_body = serde_json::json!({"jobId": job_id, "token": token});
    let (status, json) = post_json(app2, "/api/token/refresh", &refresh_body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"]["token"].is_string());
    assert_ne!(json["data"]["token"], serde_json::Value::String(token));
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn import_csv_launches_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("Moby Dick")]));
    let app = build_app(state);

    let csv_body = "isbn\n9780140449136\n9780140449137\n";
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/books/import/csv")
                .header("content-type", "text/csv")
                .header("authorization", "Bearer test-owner")
                .body(Body::from(csv_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["data"]["jobId"].is_string());
}

#[tokio::test]
async fn import_csv_rejects_ragged_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("x")]));
    let app = build_app(state);

    let csv_body = "isbn,title\n9780140449136\n";
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/books/import/csv")
                .header("content-type", "text/csv")
                .header("authorization", "Bearer test-owner")
                .body(Body::from(csv_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn import_csv_rejects_oversized_payload() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), Ok(vec![ok_record("x")]));
    let app = build_app(state);

    let mut csv_body = String::from("isbn\n");
    while (csv_body.len() as u64) <= book_config::MAX_CSV_IMPORT_BYTES {
        csv_body.push_str("9780140449136\n");
    }
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/books/import/csv")
                .header("content-type", "text/csv")
                .header("authorization", "Bearer test-owner")
                .body(Body::from(csv_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
