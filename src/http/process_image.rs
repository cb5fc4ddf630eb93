use axum::{
  extract::{rejection::JsonRejection, State},
  http::{HeaderMap, StatusCode},
  Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};
use utoipa::ToSchema;

use crate::http::error::AppError;
use crate::http::AppState;

const X_REQUEST_ID: &str = "x-request-id";
const ACK_CODE: &str = "ok";
const ACK_MESSAGE: &str = "OK";

/// Either `id` of a stored record, or `url` (plus optional `parent_id`)
/// of a source image to register first.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ProcessRequest {
  pub id: Option<i64>,
  pub url: Option<String>,
  pub parent_id: Option<i64>,
}

/// Acknowledges dispatch only; variant outcomes are never reported here,
/// so `error` stays empty once jobs are spawned.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ProcessResponse {
  pub code: String,
  pub id: i64,
  pub message: String,
  pub error: Option<String>,
}

enum Trigger {
  Record(i64),
  SourceUrl { parent_id: i64, url: String },
}

impl TryFrom<ProcessRequest> for Trigger {
  type Error = AppError;

  fn try_from(req: ProcessRequest) -> Result<Self, Self::Error> {
    match (req.id, req.url) {
      (Some(id), None) => Ok(Trigger::Record(id)),
      (None, Some(url)) if !url.trim().is_empty() => Ok(Trigger::SourceUrl {
        parent_id: req.parent_id.unwrap_or_default(),
        url,
      }),
      (None, Some(_)) => Err(AppError::BadRequest("url must not be empty".to_owned())),
      _ => Err(AppError::BadRequest(
        "exactly one of id or url is required".to_owned(),
      )),
    }
  }
}

#[utoipa::path(
  post,
  path = "/api/v1/process-image",
  request_body = ProcessRequest,
  responses(
    (status = 202, description = "Variant jobs dispatched", body = ProcessResponse),
    (status = 400, description = "Malformed request"),
    (status = 401, description = "Missing or wrong API key"),
    (status = 500, description = "Source URL could not be registered")
  ),
  security(("api_key" = []))
)]
pub(crate) async fn process_image(
  State(state): State<AppState>,
  headers: HeaderMap,
  payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProcessResponse>), AppError> {
  let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
  let trigger = Trigger::try_from(request)?;

  let request_id = headers
    .get(X_REQUEST_ID)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("-")
    .to_owned();
  let span = info_span!("process", request_id = %request_id);

  let id = async {
    match trigger {
      Trigger::Record(id) => {
        info!(record_id = id, "request received");
        state.dispatcher.process(id).await;
        Ok(id)
      }
      Trigger::SourceUrl { parent_id, url } => {
        info!(parent_id, url = %url, "request received");
        state
          .dispatcher
          .process_url(parent_id, &url)
          .await
          .map_err(|e| AppError::InternalServerError(format!("{:#}", e)))
      }
    }
  }
  .instrument(span)
  .await?;

  Ok((
    StatusCode::ACCEPTED,
    Json(ProcessResponse {
      code: ACK_CODE.to_owned(),
      id,
      message: ACK_MESSAGE.to_owned(),
      error: None,
    }),
  ))
}
