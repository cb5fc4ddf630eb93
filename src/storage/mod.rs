use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::{path::Path, sync::Arc};

use crate::config::{StorageConfig, StorageType};

mod local_storage;
mod s3;

pub use local_storage::Client as LocalClient;
pub use s3::Client as S3Client;

pub struct PutObjectOutput {
  pub etag: String,
  pub url: String,
  pub size: u64,
}

/// Destination for re-hosted derivatives. Returns a publicly resolvable URL.
#[async_trait]
pub trait BlobSink: Send + Sync {
  async fn upload_object(&self, data: Bytes, key: &str, mime: &str) -> Result<PutObjectOutput>;
}

pub fn from_config(cfg: &StorageConfig) -> Result<Arc<dyn BlobSink>> {
  let sink: Arc<dyn BlobSink> = match cfg.storage_type {
    StorageType::Local => {
      let local = match &cfg.local {
        Some(local) => local,
        None => return Err(anyhow!("local storage config is missing")),
      };
      Arc::new(LocalClient::new(
        Path::new(&local.path).to_path_buf(),
        &local.base_url,
      )?)
    }
    StorageType::S3 => {
      let storage_config = match &cfg.s3 {
        Some(s3) => s3,
        None => return Err(anyhow!("S3 storage config is missing")),
      };

      let cred = aws_sdk_s3::config::Credentials::new(
        storage_config.access_key_id.clone(),
        storage_config.secret_access_key.clone(),
        None,
        None,
        "loaded-from-custom-env",
      );

      let s3_config = aws_sdk_s3::config::Builder::new()
        .endpoint_url(storage_config.endpoint.clone())
        .credentials_provider(cred)
        .region(aws_sdk_s3::config::Region::new(
          storage_config.region.clone(),
        ))
        .force_path_style(storage_config.force_path_style) // apply bucketname as path param instead of pre-domain
        .behavior_version_latest()
        .build();

      let client = aws_sdk_s3::Client::from_conf(s3_config);
      Arc::new(S3Client::new(
        client,
        &storage_config.bucket,
        &storage_config.base_url,
      )?)
    }
  };

  Ok(sink)
}
