use axum::{
  body::Body,
  http::{header, Request, StatusCode},
  routing::{get, post},
  Json, Router,
};
use http_body_util::BodyExt;
use rusty_variants::config;
use rusty_variants::http::{self, ProcessResponse};
use rusty_variants::image_processing::{Dispatcher, ImageRecord};
use rusty_variants::records::MemoryRecords;
use rusty_variants::storage;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

const API_KEY: &str = "test";

/// Fake primary provider that also serves the transformed bytes.
/// Width 960 is always rejected.
async fn spawn_primary() -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let base = format!("http://{}", listener.local_addr().unwrap());
  let cdn = base.clone();

  let router = Router::new()
    .route(
      "/v1/url",
      post(move |Json(body): Json<Value>| {
        let cdn = cdn.clone();
        async move {
          let width = body["resize"]["width"].as_u64().unwrap_or_default();
          if width == 960 {
            return (
              StatusCode::INTERNAL_SERVER_ERROR,
              Json(json!({ "success": false })),
            );
          }
          (
            StatusCode::OK,
            Json(json!({ "success": true, "kraked_url": format!("{}/img/{}.jpg", cdn, width) })),
          )
        }
      }),
    )
    .route(
      "/img/:name",
      get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], vec![0xFFu8, 0xD8, 0xFF]) }),
    );

  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });

  format!("{}/v1/url", base)
}

async fn spawn_fallback() -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  let router = Router::new().route(
    "/v1/images",
    get(|| async { Json(json!({ "response": { "id": "abc123" } })) }),
  );

  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });

  format!("http://{}/v1/images", addr)
}

struct TestApp {
  router: Router,
  dispatcher: Dispatcher,
  records: Arc<MemoryRecords>,
  blobs: TempDir,
}

async fn bootstrap(enable_openapi: bool) -> TestApp {
  let blobs = tempfile::tempdir().unwrap();

  let cfg = config::Config {
    app: config::AppConfig {
      api_key: API_KEY.to_string(),
      listen: "0.0.0.0:0".to_string(),
      metrics_listen: "0.0.0.0:0".to_string(),
      enable_openapi: Some(enable_openapi),
    },
    storage: config::StorageConfig {
      storage_type: config::StorageType::Local,
      local: Some(config::StorageConfigLocal {
        path: blobs.path().to_string_lossy().into_owned(),
        base_url: "https://storage.test/bucket/".to_string(),
      }),
      s3: None,
    },
    records: config::RecordsConfig {
      record_store: config::RecordStoreType::Memory,
      postgres: None,
    },
    providers: config::ProvidersConfig {
      primary: config::PrimaryProviderConfig {
        endpoint: spawn_primary().await,
        api_key: "key".to_string(),
        api_secret: "secret".to_string(),
        timeout_secs: 5,
      },
      fallback: config::FallbackProviderConfig {
        endpoint: spawn_fallback().await,
        api_key: "key".to_string(),
        cdn_base_url: "https://im.ages.io".to_string(),
        timeout_secs: 5,
      },
    },
    jobs: config::JobsConfig::default(),
  };

  let records = Arc::new(MemoryRecords::default());
  records.insert(ImageRecord {
    id: 7,
    parent_id: 42,
    original_url: "https://src/x.jpg".to_string(),
    ..ImageRecord::default()
  });

  let blob_sink = storage::from_config(&cfg.storage).expect("failed creating blob sink");
  let dispatcher = Dispatcher::from_config(&cfg, records.clone(), blob_sink)
    .expect("failed creating dispatcher");
  let router = http::router(&cfg, dispatcher.clone()).expect("failed creating router");

  TestApp {
    router,
    dispatcher,
    records,
    blobs,
  }
}

fn trigger(body: Value) -> Request<Body> {
  Request::builder()
    .method("POST")
    .uri("/api/v1/process-image")
    .header("X-API-Key", API_KEY)
    .header("x-request-id", "req-1")
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(body.to_string()))
    .unwrap()
}

async fn ack(response: axum::response::Response) -> ProcessResponse {
  let body = response.into_body().collect().await.unwrap().to_bytes();
  serde_json::from_slice(&body).expect("invalid ack body")
}

#[tokio::test]
async fn derives_all_variants_with_fallback_for_failed_size() {
  let app = bootstrap(false).await;

  let response = app
    .router
    .clone()
    .oneshot(trigger(json!({ "id": 7 })))
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::ACCEPTED);
  let body = response.into_body().collect().await.unwrap().to_bytes();
  let ack: Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(
    ack,
    json!({ "code": "ok", "message": "OK", "id": 7, "error": null })
  );

  app.dispatcher.wait_idle().await;

  let record = app.records.get(7).unwrap();
  let large = record.large_url.expect("large variant missing");
  let small = record.small_url.expect("small variant missing");
  assert!(large.starts_with("https://storage.test/bucket/42-"));
  assert!(small.starts_with("https://storage.test/bucket/42-"));
  assert_eq!(
    record.medium_url.as_deref(),
    Some("https://im.ages.io/abc123?width=960")
  );

  let object = large.rsplit('/').next().unwrap();
  let stored = tokio::fs::read(app.blobs.path().join(object)).await.unwrap();
  assert_eq!(stored, vec![0xFFu8, 0xD8, 0xFF]);
}

#[tokio::test]
async fn raw_url_trigger_registers_record() {
  let app = bootstrap(false).await;

  let response = app
    .router
    .clone()
    .oneshot(trigger(
      json!({ "url": "https://src/new.jpg", "parent_id": 5 }),
    ))
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::ACCEPTED);
  let id = ack(response).await.id;
  assert_ne!(id, 7);

  app.dispatcher.wait_idle().await;

  let record = app.records.get(id).unwrap();
  assert_eq!(record.parent_id, 5);
  assert_eq!(record.original_url, "https://src/new.jpg");
  assert!(record.large_url.unwrap().starts_with("https://storage.test/bucket/5-"));
}

#[tokio::test]
async fn unknown_record_is_acknowledged_and_left_alone() {
  let app = bootstrap(false).await;

  let response = app
    .router
    .clone()
    .oneshot(trigger(json!({ "id": 404 })))
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::ACCEPTED);
  app.dispatcher.wait_idle().await;
  assert!(app.records.get(404).is_none());
}

#[tokio::test]
async fn requires_api_key() {
  let app = bootstrap(false).await;

  let response = app
    .router
    .clone()
    .oneshot(
      Request::builder()
        .method("POST")
        .uri("/api/v1/process-image")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"id": 7}"#))
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  assert_eq!(app.dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn rejects_malformed_trigger() {
  let app = bootstrap(false).await;

  for body in [json!({}), json!({ "id": 7, "url": "https://src/x.jpg" }), json!({ "id": "seven" })] {
    let response = app.router.clone().oneshot(trigger(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}

#[tokio::test]
async fn serves_openapi_document_when_enabled() {
  let app = bootstrap(true).await;

  let response = app
    .router
    .clone()
    .oneshot(
      Request::builder()
        .uri("/api-docs/openapi.json")
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  let body = response.into_body().collect().await.unwrap().to_bytes();
  let doc: Value = serde_json::from_slice(&body).unwrap();
  assert!(doc["paths"]["/api/v1/process-image"].is_object());
}
