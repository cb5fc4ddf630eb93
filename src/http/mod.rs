use axum::{
  extract::{MatchedPath, Request, State},
  http::StatusCode,
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{get, post},
  Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::future::ready;
use tokio::signal;
use tokio::time::{Duration, Instant};
use tower_http::{
  catch_panic::CatchPanicLayer,
  timeout::TimeoutLayer,
  trace::{self, TraceLayer},
};
use tracing::{error, Level};
use utoipa::OpenApi;
use utoipa_redoc::{Redoc, Servable};

use crate::config::{AppConfig, Config};
use crate::image_processing::Dispatcher;
use crate::records;
use crate::storage;
use anyhow::{Context, Result};

mod error;
mod process_image;

pub use process_image::{ProcessRequest, ProcessResponse};

#[derive(OpenApi)]
#[openapi(
  paths(process_image::process_image),
  components(schemas(ProcessRequest, ProcessResponse)),
  modifiers(&SecurityAddon),
  info(
    title = "Rusty Variants API",
    version = "0.1.0",
    description = "Triggers derivation of resized image variants through remote providers"
  )
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
  fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
    if let Some(components) = openapi.components.as_mut() {
      components.add_security_scheme(
        "api_key",
        utoipa::openapi::security::SecurityScheme::ApiKey(
          utoipa::openapi::security::ApiKey::Header(utoipa::openapi::security::ApiKeyValue::new(
            "X-API-Key",
          )),
        ),
      );
    }
  }
}

#[derive(Clone)]
pub(crate) struct AppState {
  dispatcher: Dispatcher,
  api_key: String,
}

const X_API_KEY: &str = "X-API-Key";

async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
  let auth_header = req
    .headers()
    .get(X_API_KEY)
    .and_then(|header| header.to_str().ok());

  let auth_header = if let Some(auth_header) = auth_header {
    auth_header
  } else {
    return StatusCode::UNAUTHORIZED.into_response();
  };

  if !auth_header.eq(&state.api_key) {
    return StatusCode::UNAUTHORIZED.into_response();
  }

  next.run(req).await
}

/// Builds the record store, blob sink, providers and dispatcher from `cfg`.
pub async fn bootstrap(cfg: &Config) -> Result<(Router, Dispatcher)> {
  let records = records::from_config(&cfg.records).await?;
  let blob_sink = storage::from_config(&cfg.storage)?;
  let dispatcher = Dispatcher::from_config(cfg, records, blob_sink)?;

  let router = router(cfg, dispatcher.clone())?;
  Ok((router, dispatcher))
}

pub fn router(cfg: &Config, dispatcher: Dispatcher) -> Result<Router> {
  let state = AppState {
    dispatcher,
    api_key: cfg.app.api_key.clone(),
  };

  let private_app = Router::new()
    .route("/api/v1/process-image", post(process_image::process_image))
    .layer(middleware::from_fn_with_state(state.clone(), auth));

  let mut app = Router::new().merge(private_app).with_state(state);

  // Conditionally add OpenAPI routes if enabled
  if cfg.app.enable_openapi.unwrap_or(false) {
    app = app
      .merge(Redoc::with_url(
        "/redoc",
        serde_json::to_value(ApiDoc::openapi())?,
      ))
      .route(
        "/api-docs/openapi.json",
        get(|| async { axum::Json(ApiDoc::openapi()) }),
      );
  }

  let app = app.layer((
    middleware::from_fn(track_metrics),
    TraceLayer::new_for_http()
      .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
      .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
    TimeoutLayer::new(Duration::from_secs(60)),
    CatchPanicLayer::new(),
  ));

  Ok(app)
}

/// Runs the API and metrics servers until a shutdown signal. Returns as
/// soon as either of them fails, stopping the other.
pub async fn run(router: Router, app: &AppConfig) -> Result<()> {
  tokio::try_join!(
    serve(router, &app.listen),
    serve_metrics(&app.metrics_listen),
  )?;

  Ok(())
}

pub async fn serve(router: Router, listen: &str) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .with_context(|| format!("failed to bind {}", listen))?;
  axum::serve(listener, router)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  Ok(())
}

async fn healthz() -> &'static str {
  "pong"
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      error!("failed to install Ctrl+C handler: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(e) => {
        error!("failed to install signal handler: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
      _ = ctrl_c => {},
      _ = terminate => {},
  }
}

pub async fn serve_metrics(listen: &str) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .with_context(|| format!("failed to bind {}", listen))?;
  let app = metrics_app()?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  Ok(())
}

fn metrics_app() -> Result<Router> {
  let recorder_handle = setup_metrics_recorder()?;
  Ok(
    Router::new()
      .route("/metrics", get(move || ready(recorder_handle.render())))
      .route("/healthz", get(healthz)),
  )
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
  const EXPONENTIAL_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
  ];

  let handle = PrometheusBuilder::new()
    .set_buckets_for_metric(
      Matcher::Full("http_requests_duration_seconds".to_string()),
      EXPONENTIAL_SECONDS,
    )?
    .install_recorder()?;

  Ok(handle)
}

async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
  let start = Instant::now();
  let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
    matched_path.as_str().to_owned()
  } else {
    req.uri().path().to_owned()
  };
  let method = req.method().clone();

  let response = next.run(req).await;

  let latency = start.elapsed().as_secs_f64();
  let status = response.status().as_u16().to_string();

  let labels = [
    ("method", method.to_string()),
    ("path", path),
    ("status", status),
  ];

  metrics::counter!("http_requests_total", &labels).increment(1);
  metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

  response
}
