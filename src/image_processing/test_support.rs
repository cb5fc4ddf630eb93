use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
  http::{header, StatusCode},
  routing::get,
  Router,
};
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ImageRecord, JobContext, RecordId, VariantField};
use crate::records::{MemoryRecords, RecordGateway};
use crate::storage::{BlobSink, PutObjectOutput};
use crate::transform::{Derivative, ProviderError, Transformer};

type Script = Box<dyn Fn(u32) -> Result<Derivative, ProviderError> + Send + Sync>;

/// Provider whose answer is computed from the requested dimension.
pub struct ScriptedProvider {
  script: Script,
  calls: AtomicUsize,
  dimensions: Mutex<Vec<u32>>,
}

impl ScriptedProvider {
  pub fn new<F>(script: F) -> Arc<Self>
  where
    F: Fn(u32) -> Result<Derivative, ProviderError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      script: Box::new(script),
      calls: AtomicUsize::new(0),
      dimensions: Mutex::new(Vec::new()),
    })
  }

  pub fn remote(url: String) -> Arc<Self> {
    Self::new(move |_| Ok(Derivative::Remote(url.clone())))
  }

  /// Mimics the fallback CDN layout.
  pub fn hosted(id: &'static str) -> Arc<Self> {
    Self::new(move |dimension| {
      Ok(Derivative::Hosted(format!(
        "https://im.ages.io/{}?width={}",
        id, dimension
      )))
    })
  }

  pub fn failing(err: ProviderError) -> Arc<Self> {
    Self::new(move |_| Err(err.clone()))
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn dimensions(&self) -> Vec<u32> {
    let mut dims = self.dimensions.lock().clone();
    dims.sort_unstable();
    dims
  }
}

#[async_trait]
impl Transformer for ScriptedProvider {
  fn name(&self) -> &str {
    "scripted"
  }

  async fn transform(&self, source_url: &str, dimension: u32) -> Result<Derivative, ProviderError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.dimensions.lock().push(dimension);

    if source_url.is_empty() {
      return Err(ProviderError::InvalidRequest("empty source url".to_owned()));
    }

    (self.script)(dimension)
  }
}

/// Blob sink that remembers uploads and can be made slow or broken.
pub struct RecordingSink {
  delay: Option<Duration>,
  broken: bool,
  uploads: Mutex<Vec<(String, String, usize)>>,
}

impl RecordingSink {
  fn build(delay: Option<Duration>, broken: bool) -> Arc<Self> {
    Arc::new(Self {
      delay,
      broken,
      uploads: Mutex::new(Vec::new()),
    })
  }

  pub fn new() -> Arc<Self> {
    Self::build(None, false)
  }

  pub fn slow(delay: Duration) -> Arc<Self> {
    Self::build(Some(delay), false)
  }

  /// Rejects every upload like a bucket refusing the write.
  pub fn broken() -> Arc<Self> {
    Self::build(None, true)
  }

  /// `(key, mime, size)` per completed upload.
  pub fn uploads(&self) -> Vec<(String, String, usize)> {
    self.uploads.lock().clone()
  }
}

#[async_trait]
impl BlobSink for RecordingSink {
  async fn upload_object(&self, data: Bytes, key: &str, mime: &str) -> Result<PutObjectOutput> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.broken {
      return Err(anyhow!("403 Forbidden: bucket rejected {}", key));
    }

    self
      .uploads
      .lock()
      .push((key.to_owned(), mime.to_owned(), data.len()));

    Ok(PutObjectOutput {
      etag: "etag".to_owned(),
      url: format!("https://bucket.test/{}", key),
      size: data.len() as u64,
    })
  }
}

/// Record gateway whose first `failures` writes fail.
pub struct FlakyRecords {
  inner: Arc<MemoryRecords>,
  failures: u32,
  update_calls: AtomicU32,
}

impl FlakyRecords {
  pub fn new(inner: Arc<MemoryRecords>, failures: u32) -> Self {
    Self {
      inner,
      failures,
      update_calls: AtomicU32::new(0),
    }
  }

  pub fn update_calls(&self) -> u32 {
    self.update_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl RecordGateway for FlakyRecords {
  async fn load(&self, id: RecordId) -> Result<ImageRecord> {
    self.inner.load(id).await
  }

  async fn update_field(&self, id: RecordId, field: VariantField, value: &str) -> Result<()> {
    let call = self.update_calls.fetch_add(1, Ordering::SeqCst);
    if call < self.failures {
      return Err(anyhow!("connection reset"));
    }

    self.inner.update_field(id, field, value).await
  }

  async fn create(&self, parent_id: i64, original_url: &str) -> Result<RecordId> {
    self.inner.create(parent_id, original_url).await
  }
}

pub fn context(
  primary: &Arc<ScriptedProvider>,
  fallback: &Arc<ScriptedProvider>,
  sink: &Arc<RecordingSink>,
  records: Arc<dyn RecordGateway>,
) -> Arc<JobContext> {
  Arc::new(JobContext {
    primary: primary.clone(),
    fallback: fallback.clone(),
    blob_sink: sink.clone(),
    records,
    http: reqwest::Client::builder()
      .timeout(Duration::from_secs(5))
      .build()
      .unwrap(),
    upload_deadline: Duration::from_millis(200),
    persist_attempts: 3,
    persist_backoff: Duration::from_millis(10),
  })
}

/// Serves `/img/:name` as a small PNG payload and `/gone/:name` as 404.
pub async fn spawn_cdn() -> String {
  let router = Router::new()
    .route(
      "/img/:name",
      get(|| async { ([(header::CONTENT_TYPE, "image/png")], "PNG-BYTES") }),
    )
    .route("/gone/:name", get(|| async { StatusCode::NOT_FOUND }));

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });

  format!("http://{}", addr)
}
