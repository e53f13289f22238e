// Integration tests for POST /api/ingest
//
// The router runs against MemoryStorage (or a storage that fails on demand),
// so every response can be checked against what was actually persisted.

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use hindsight::anonymize::{Anonymizer, SecretSeed};
use hindsight::api::{create_router, AppState, IngestResponse};
use hindsight::enrich::{EnrichedEvent, Enricher};
use hindsight::ingest::Pipeline;
use hindsight::storage::{Filter, MemoryStorage, Storage};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

// ── Test helpers ──────────────────────────────────────────────────────────────

/// Refuses events whose path is `/fail`, stores the rest
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn store(&self, events: &[EnrichedEvent]) -> anyhow::Result<()> {
        if events.iter().any(|e| e.path == "/fail") {
            return Err(anyhow!("database is locked"));
        }
        self.inner.store(events).await
    }

    async fn fetch(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        filter: &Filter,
    ) -> anyhow::Result<Vec<EnrichedEvent>> {
        self.inner.fetch(from, until, filter).await
    }
}

fn create_test_app(storage: Arc<dyn Storage>, max_body_bytes: usize, token: Option<&str>) -> Router {
    create_router(AppState {
        pipeline: Pipeline::new(
            Anonymizer::new(SecretSeed::new("http-test")),
            Enricher::default(),
            storage,
        ),
        max_body_bytes,
        api_token: token.map(str::to_string),
    })
}

fn event(path: &str) -> serde_json::Value {
    json!({
        "Time": "2024-02-11T13:00:00.250Z",
        "IP": "203.0.113.7",
        "Host": "example.com",
        "Method": "GET",
        "Path": path,
        "UserAgent": "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) Version/17.2 Mobile/15E148 Safari/604.1",
        "StatusCode": 200,
        "BytesWritten": 1234,
        "Duration": 15
    })
}

fn ndjson(lines: &[String]) -> String {
    lines.iter().map(|l| format!("{}\n", l)).collect()
}

async fn post(app: Router, content_type: &str, body: impl Into<Body>) -> (StatusCode, IngestResponse) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ingest")
                .header("Content-Type", content_type)
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Single JSON event → 200, stored and enriched
#[tokio::test]
async fn test_single_event_is_stored() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let (status, resp) = post(app, "application/json; charset=utf-8", event("/").to_string()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        resp,
        IngestResponse {
            ok: true,
            status: 200,
            ingested: 1,
            error: None
        }
    );

    let stored = storage.events();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].device.as_str(), "mobile");
    assert_eq!(stored[0].os.name, "iOS");
    assert_eq!(stored[0].duration_ms, 15);
    assert_eq!(stored[0].key.as_str().len(), 43);
}

/// Unresolvable address still stored, with location sentinels
#[tokio::test]
async fn test_unresolvable_ip_stored_with_sentinels() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let mut body = event("/");
    body["IP"] = json!("::1");
    let (status, _) = post(app, "application/json", body.to_string()).await;

    assert_eq!(status, StatusCode::OK);
    let stored = storage.events();
    assert_eq!(stored[0].country_code, "XX");
    assert_eq!(stored[0].time_zone, "UTC");
}

/// Invalid single event → 400, nothing stored
#[tokio::test]
async fn test_invalid_single_event_returns_400() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let mut body = event("/");
    body["StatusCode"] = json!(600);
    let (status, resp) = post(app, "application/json", body.to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!resp.ok);
    assert_eq!(resp.status, 400);
    assert_eq!(resp.ingested, 0);
    assert!(resp.error.unwrap().contains("StatusCode"));
    assert!(storage.is_empty());
}

/// NDJSON batch with line k malformed → k-1 stored, 422
#[tokio::test]
async fn test_ndjson_stops_at_malformed_line() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let mut missing_ip = event("/3");
    missing_ip.as_object_mut().unwrap().remove("IP");
    let lines = vec![
        event("/1").to_string(),
        event("/2").to_string(),
        missing_ip.to_string(),
        event("/4").to_string(),
        event("/5").to_string(),
    ];

    let (status, resp) = post(app, "application/x-ndjson", ndjson(&lines)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(!resp.ok);
    assert_eq!(resp.status, 422);
    assert_eq!(resp.ingested, 2);
    let error = resp.error.unwrap();
    assert!(error.starts_with("line 3:"), "{}", error);
    assert!(error.contains("IP"));

    let paths: Vec<String> = storage.events().into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["/1", "/2"]);
}

/// Blank lines and CRLF terminators are tolerated
#[tokio::test]
async fn test_ndjson_skips_blank_lines() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let body = format!("{}\r\n\r\n{}", event("/a"), event("/b"));
    let (status, resp) = post(app, "application/ndjson", body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp.ingested, 2);
    assert_eq!(storage.len(), 2);
}

/// Storage failure mid-batch: remaining lines still processed, 500 at the end
#[tokio::test]
async fn test_ndjson_storage_failure_continues_batch() {
    let storage = Arc::new(FlakyStorage::default());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let lines = vec![
        event("/1").to_string(),
        event("/fail").to_string(),
        event("/3").to_string(),
    ];
    let (status, resp) = post(app, "application/x-ndjson", ndjson(&lines)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!resp.ok);
    assert_eq!(resp.ingested, 2);
    let error = resp.error.unwrap();
    assert!(error.contains("1 event(s)"), "{}", error);
    assert!(error.contains("database is locked"));

    let paths: Vec<String> = storage.inner.events().into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["/1", "/3"]);
}

/// Storage failure for a single event → 500
#[tokio::test]
async fn test_single_event_storage_failure_returns_500() {
    let app = create_test_app(Arc::new(FlakyStorage::default()), 1024 * 1024, None);

    let (status, resp) = post(app, "application/json", event("/fail").to_string()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.ingested, 0);
}

/// Anything but JSON or NDJSON → 406
#[tokio::test]
async fn test_unknown_content_type_returns_406() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let (status, resp) = post(app, "text/plain", event("/").to_string()).await;

    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(resp.status, 406);
    assert!(storage.is_empty());
}

/// Body over the configured limit → 413
#[tokio::test]
async fn test_body_too_large_returns_413() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 64, None);

    let (status, resp) = post(app, "application/x-ndjson", ndjson(&[event("/").to_string()])).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(resp.status, 413);
    assert!(storage.is_empty());
}

/// With a token configured, requests without it → 401
#[tokio::test]
async fn test_missing_or_wrong_token_returns_401() {
    let storage = Arc::new(MemoryStorage::new());

    let (status, resp) = post(
        create_test_app(storage.clone(), 1024 * 1024, Some("ingest-secret")),
        "application/json",
        event("/").to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp.error.as_deref(), Some("Authorization token not provided"));

    let response = create_test_app(storage.clone(), 1024 * 1024, Some("ingest-secret"))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ingest")
                .header("Content-Type", "application/json")
                .header("Authorization", "Bearer not-the-secret")
                .body(Body::from(event("/").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(storage.is_empty());
}

/// Correct token → accepted
#[tokio::test]
async fn test_correct_token_is_accepted() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, Some("ingest-secret"));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ingest")
                .header("Content-Type", "application/json")
                .header("Authorization", "Bearer ingest-secret")
                .body(Body::from(event("/").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(storage.len(), 1);
}

/// Same visitor on one day shares a key; the next day it does not
#[tokio::test]
async fn test_visitor_keys_rotate_daily() {
    let storage = Arc::new(MemoryStorage::new());
    let app = create_test_app(storage.clone(), 1024 * 1024, None);

    let mut later_same_day = event("/b");
    later_same_day["Time"] = json!("2024-02-11T23:59:59Z");
    let mut next_day = event("/c");
    next_day["Time"] = json!("2024-02-12T00:00:00Z");
    let lines = vec![event("/a").to_string(), later_same_day.to_string(), next_day.to_string()];

    let (status, _) = post(app, "application/x-ndjson", ndjson(&lines)).await;
    assert_eq!(status, StatusCode::OK);

    let stored = storage.events();
    assert_eq!(stored[0].key, stored[1].key);
    assert_ne!(stored[1].key, stored[2].key);
}
