use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use super::{ImageRecord, JobContext, RecordId, VariantJob, VariantSpec};
use crate::config::Config;
use crate::records::RecordGateway;
use crate::storage::BlobSink;
use crate::transform::{ImageResizerClient, KrakenClient};

/// Starts one variant job per configured size and returns without waiting.
///
/// Jobs run on a task tracker so the process can join them on shutdown,
/// and a semaphore caps how many run at once.
#[derive(Clone)]
pub struct Dispatcher {
  inner: Arc<Inner>,
}

struct Inner {
  ctx: Arc<JobContext>,
  variants: Vec<VariantSpec>,
  tracker: TaskTracker,
  permits: Arc<Semaphore>,
  /// Set once by `shutdown`; guards every close/reopen of `tracker`.
  shutting_down: Mutex<bool>,
}

impl Dispatcher {
  pub fn new(ctx: JobContext, variants: Vec<VariantSpec>, max_concurrent_jobs: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        ctx: Arc::new(ctx),
        variants,
        tracker: TaskTracker::new(),
        permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        shutting_down: Mutex::new(false),
      }),
    }
  }

  pub fn from_config(
    cfg: &Config,
    records: Arc<dyn RecordGateway>,
    blob_sink: Arc<dyn BlobSink>,
  ) -> Result<Self> {
    let primary = KrakenClient::new(&cfg.providers.primary)?;
    let fallback = ImageResizerClient::new(&cfg.providers.fallback)?;
    let http = reqwest::Client::builder()
      .timeout(cfg.jobs.fetch_timeout())
      .build()
      .context("failed to create download client")?;

    let ctx = JobContext {
      primary: Arc::new(primary),
      fallback: Arc::new(fallback),
      blob_sink,
      records,
      http,
      upload_deadline: cfg.jobs.upload_deadline(),
      persist_attempts: cfg.jobs.persist_attempts,
      persist_backoff: cfg.jobs.persist_backoff(),
    };

    Ok(Self::new(
      ctx,
      cfg.jobs.variant_specs(),
      cfg.jobs.max_concurrent_jobs,
    ))
  }

  /// Loads record `id` once and spawns its variant jobs.
  ///
  /// A missing record is not an error: the zero value is dispatched and
  /// every job fails at its provider call.
  pub async fn process(&self, id: RecordId) {
    let record = match self.inner.ctx.records.load(id).await {
      Ok(record) => record,
      Err(e) => {
        error!(record_id = id, error = %format!("{:#}", e), "failed to load record");
        ImageRecord::default()
      }
    };

    if record.original_url.is_empty() {
      warn!(record_id = id, "record not found or without source url");
    }

    self.spawn_jobs(id, record);
  }

  /// Creates a record for a raw source URL and dispatches it.
  pub async fn process_url(&self, parent_id: i64, original_url: &str) -> Result<RecordId> {
    let id = self
      .inner
      .ctx
      .records
      .create(parent_id, original_url)
      .await?;

    let record = ImageRecord {
      id,
      parent_id,
      original_url: original_url.to_owned(),
      ..ImageRecord::default()
    };
    self.spawn_jobs(id, record);

    Ok(id)
  }

  fn spawn_jobs(&self, id: RecordId, record: ImageRecord) {
    let record = Arc::new(record);

    for spec in &self.inner.variants {
      let job = VariantJob::new(record.clone(), *spec, self.inner.ctx.clone());
      let permits = self.inner.permits.clone();
      let span = info_span!(
        "variant_job",
        record_id = id,
        parent_id = record.parent_id,
        variant = %spec.field,
        dimension = spec.dimension
      );

      self.inner.tracker.spawn(
        async move {
          let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
          };
          job.run().await;
        }
        .instrument(span),
      );
    }

    info!(record_id = id, jobs = self.inner.variants.len(), "variant jobs dispatched");
  }

  pub fn in_flight(&self) -> usize {
    self.inner.tracker.len()
  }

  /// Waits until every job spawned so far has finished.
  ///
  /// The tracker is reopened afterwards unless `shutdown` was called in
  /// the meantime.
  pub async fn wait_idle(&self) {
    self.inner.tracker.close();
    self.inner.tracker.wait().await;

    let shutting_down = self.inner.shutting_down.lock();
    if !*shutting_down {
      self.inner.tracker.reopen();
    }
  }

  /// Joins in-flight jobs for at most `grace`. Returns false if some were
  /// still running when the grace period ran out.
  pub async fn shutdown(&self, grace: Duration) -> bool {
    {
      let mut shutting_down = self.inner.shutting_down.lock();
      *shutting_down = true;
      self.inner.tracker.close();
    }

    match tokio::time::timeout(grace, self.inner.tracker.wait()).await {
      Ok(()) => {
        info!("all variant jobs finished");
        true
      }
      Err(_) => {
        warn!(
          abandoned = self.inner.tracker.len(),
          "shutdown grace period elapsed with variant jobs in flight"
        );
        false
      }
    }
  }
}
