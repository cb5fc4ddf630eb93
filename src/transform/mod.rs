//! Remote image transformation providers.
//!
//! Both providers implement [`Transformer`], so a variant job can be written
//! once and handed any provider. They differ in what they return: the primary
//! provider hands back a temporary URL that must be fetched and re-hosted,
//! the fallback provider hosts the result itself.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod imageresizer;
mod kraken;

pub use imageresizer::ImageResizerClient;
pub use kraken::KrakenClient;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  #[error("transport error: {0}")]
  Transport(String),
  #[error("provider responded with status {0}")]
  Status(u16),
  #[error("invalid response: {0}")]
  InvalidResponse(String),
}

/// Where the transformed image lives after a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivative {
  /// Temporary location; bytes must be fetched and stored in the blob sink.
  Remote(String),
  /// Final, provider-hosted location; persisted as is.
  Hosted(String),
}

#[async_trait]
pub trait Transformer: Send + Sync {
  /// Short name used in logs and metrics.
  fn name(&self) -> &str;

  /// Requests a `dimension` x `dimension` derivative of `source_url`.
  async fn transform(&self, source_url: &str, dimension: u32) -> Result<Derivative, ProviderError>;
}

/// An empty source URL is the not-found signal from the record gateway.
fn ensure_source(source_url: &str) -> Result<(), ProviderError> {
  if source_url.trim().is_empty() {
    return Err(ProviderError::InvalidRequest("empty source url".to_owned()));
  }

  Ok(())
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
  reqwest::Client::builder()
    .timeout(Duration::from_secs(timeout_secs))
    .build()
    .map_err(|e| ProviderError::Transport(format!("failed to create HTTP client: {}", e)))
}

fn transport_error(e: reqwest::Error) -> ProviderError {
  if e.is_timeout() {
    ProviderError::Transport(format!("request timed out: {}", e))
  } else {
    ProviderError::Transport(e.to_string())
  }
}
