use crate::storage::{BlobSink, PutObjectOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;
use url::Url;

pub struct Client {
  s3_client: aws_sdk_s3::Client,
  bucket: String,
  base_url: Url,
}

impl Client {
  pub fn new(s3_client: aws_sdk_s3::Client, bucket: &str, base_url: &str) -> Result<Self> {
    let base_url =
      Url::parse(base_url).with_context(|| format!("failed to parse base url: {}", base_url))?;

    Ok(Self {
      s3_client,
      bucket: bucket.to_owned(),
      base_url,
    })
  }
}

#[async_trait]
impl BlobSink for Client {
  async fn upload_object(&self, data: Bytes, key: &str, mime: &str) -> Result<PutObjectOutput> {
    let size = data.len() as u64;

    debug!(key, bucket = %self.bucket, size, "uploading object");

    let res = self
      .s3_client
      .put_object()
      .bucket(self.bucket.as_str())
      .key(key)
      .body(ByteStream::from(data))
      .cache_control("public, max-age=31536000, immutable".to_owned())
      .content_type(mime)
      .send()
      .await
      .context("failed to upload object")?;

    let url = self.base_url.join(key)?.to_string();

    Ok(PutObjectOutput {
      etag: res.e_tag.unwrap_or_default().trim_matches('"').into(),
      url,
      size,
    })
  }
}
