use std::path::PathBuf;

use crate::storage::{BlobSink, PutObjectOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

/// Writes blobs below a directory, for development setups where a static
/// file server publishes that directory at `base_url`.
pub struct Client {
  path: PathBuf,
  base_url: Url,
}

impl Client {
  pub fn new(path: PathBuf, base_url: &str) -> Result<Self> {
    let base_url =
      Url::parse(base_url).with_context(|| format!("failed to parse base url: {}", base_url))?;

    Ok(Self { path, base_url })
  }
}

#[async_trait]
impl BlobSink for Client {
  async fn upload_object(&self, data: Bytes, key: &str, _mime: &str) -> Result<PutObjectOutput> {
    let size = data.len() as u64;

    let file_path = self.path.join(key);

    if let Some(parent) = file_path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create directory: {}", key))?;
    }

    tokio::fs::write(&file_path, &data)
      .await
      .with_context(|| format!("failed to write file: {}", key))?;

    Ok(PutObjectOutput {
      etag: "".to_owned(),
      url: self.base_url.join(key)?.to_string(),
      size,
    })
  }
}
