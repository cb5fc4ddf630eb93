use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{ensure_source, http_client, transport_error, Derivative, ProviderError, Transformer};
use crate::config::FallbackProviderConfig;

#[derive(Deserialize, Debug)]
struct UploadResponse {
  response: UploadedImage,
}

#[derive(Deserialize, Debug)]
struct UploadedImage {
  id: String,
}

/// Fallback provider: ingests the source by URL and serves resized
/// renditions from its own CDN, so nothing needs re-hosting.
pub struct ImageResizerClient {
  http: reqwest::Client,
  endpoint: String,
  api_key: String,
  cdn_base_url: Url,
}

impl ImageResizerClient {
  pub fn new(cfg: &FallbackProviderConfig) -> Result<Self, ProviderError> {
    let cdn_base_url = Url::parse(&cfg.cdn_base_url)
      .map_err(|e| ProviderError::InvalidRequest(format!("invalid cdn base url: {}", e)))?;
    if cdn_base_url.cannot_be_a_base() {
      return Err(ProviderError::InvalidRequest(format!(
        "cdn base url cannot carry a path: {}",
        cdn_base_url
      )));
    }

    Ok(Self {
      http: http_client(cfg.timeout_secs)?,
      endpoint: cfg.endpoint.clone(),
      api_key: cfg.api_key.clone(),
      cdn_base_url,
    })
  }

  /// `<cdn>/<id>?width=<dimension>`, with `id` escaped as one path segment.
  fn hosted_url(&self, id: &str, dimension: u32) -> Result<String, ProviderError> {
    let mut url = self.cdn_base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| ProviderError::InvalidRequest("cdn base url cannot carry a path".to_owned()))?
      .pop_if_empty()
      .push(id);
    url
      .query_pairs_mut()
      .clear()
      .append_pair("width", &dimension.to_string());

    Ok(url.into())
  }
}

fn content_id(body: &[u8]) -> Result<String, ProviderError> {
  let res: UploadResponse =
    serde_json::from_slice(body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

  if res.response.id.is_empty() {
    return Err(ProviderError::InvalidResponse("empty content id".to_owned()));
  }

  Ok(res.response.id)
}

#[async_trait]
impl Transformer for ImageResizerClient {
  fn name(&self) -> &str {
    "imageresizer"
  }

  async fn transform(&self, source_url: &str, dimension: u32) -> Result<Derivative, ProviderError> {
    ensure_source(source_url)?;

    debug!(endpoint = %self.endpoint, dimension, "submitting source to fallback provider");

    let response = self
      .http
      .get(&self.endpoint)
      .query(&[("key", self.api_key.as_str()), ("url", source_url)])
      .send()
      .await
      .map_err(transport_error)?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
      return Err(ProviderError::Status(status.as_u16()));
    }

    let body = response.bytes().await.map_err(transport_error)?;
    let id = content_id(&body)?;

    Ok(Derivative::Hosted(self.hosted_url(&id, dimension)?))
  }
}
