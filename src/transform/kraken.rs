use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_source, http_client, transport_error, Derivative, ProviderError, Transformer};
use crate::config::PrimaryProviderConfig;

#[derive(Serialize, Debug)]
struct KrakenRequest<'a> {
  auth: KrakenAuth<'a>,
  url: &'a str,
  resize: KrakenResize,
  wait: bool,
}

#[derive(Serialize, Debug)]
struct KrakenAuth<'a> {
  api_key: &'a str,
  api_secret: &'a str,
}

#[derive(Serialize, Debug)]
struct KrakenResize {
  width: u32,
  height: u32,
  strategy: &'static str,
  enhance: bool,
}

#[derive(Deserialize, Debug)]
struct KrakenResponse {
  #[serde(default)]
  success: Option<bool>,
  kraked_url: Option<String>,
  message: Option<String>,
}

/// Primary provider: POSTs a resize job and waits for the result URL.
pub struct KrakenClient {
  http: reqwest::Client,
  endpoint: String,
  api_key: String,
  api_secret: String,
}

impl KrakenClient {
  pub fn new(cfg: &PrimaryProviderConfig) -> Result<Self, ProviderError> {
    Ok(Self {
      http: http_client(cfg.timeout_secs)?,
      endpoint: cfg.endpoint.clone(),
      api_key: cfg.api_key.clone(),
      api_secret: cfg.api_secret.clone(),
    })
  }

  fn request<'a>(&'a self, source_url: &'a str, dimension: u32) -> KrakenRequest<'a> {
    KrakenRequest {
      auth: KrakenAuth {
        api_key: &self.api_key,
        api_secret: &self.api_secret,
      },
      url: source_url,
      resize: KrakenResize {
        width: dimension,
        height: dimension,
        strategy: "auto",
        enhance: true,
      },
      wait: true,
    }
  }
}

fn derivative_from(body: &[u8]) -> Result<Derivative, ProviderError> {
  let res: KrakenResponse =
    serde_json::from_slice(body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

  if res.success == Some(false) {
    return Err(ProviderError::InvalidResponse(
      res.message.unwrap_or_else(|| "provider reported failure".to_owned()),
    ));
  }

  match res.kraked_url {
    Some(url) if !url.is_empty() => Ok(Derivative::Remote(url)),
    _ => Err(ProviderError::InvalidResponse(
      "missing kraked_url".to_owned(),
    )),
  }
}

#[async_trait]
impl Transformer for KrakenClient {
  fn name(&self) -> &str {
    "kraken"
  }

  async fn transform(&self, source_url: &str, dimension: u32) -> Result<Derivative, ProviderError> {
    ensure_source(source_url)?;

    debug!(endpoint = %self.endpoint, dimension, "submitting resize to primary provider");

    let response = self
      .http
      .post(&self.endpoint)
      .json(&self.request(source_url, dimension))
      .send()
      .await
      .map_err(transport_error)?;

    let status = response.status();
    if !status.is_success() {
      return Err(ProviderError::Status(status.as_u16()));
    }

    let body = response.bytes().await.map_err(transport_error)?;
    derivative_from(&body)
  }
}
