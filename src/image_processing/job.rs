use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{object_name, ImageRecord, VariantSpec};
use crate::records::RecordGateway;
use crate::storage::BlobSink;
use crate::transform::{Derivative, ProviderError, Transformer};

const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  Primary,
  Fallback,
}

impl Tier {
  pub fn as_str(self) -> &'static str {
    match self {
      Tier::Primary => "primary",
      Tier::Fallback => "fallback",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Step of a job a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Transform,
  Fetch,
  Upload,
  Persist,
}

impl Stage {
  pub fn as_str(self) -> &'static str {
    match self {
      Stage::Transform => "transform",
      Stage::Fetch => "fetch",
      Stage::Upload => "upload",
      Stage::Persist => "persist",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug)]
pub enum JobError {
  #[error("provider failed: {0}")]
  Provider(#[from] ProviderError),
  #[error("failed to fetch transformed image: {0}")]
  Fetch(String),
  #[error("failed to upload transformed image: {0}")]
  Upload(String),
  #[error("upload did not finish within {0:?}")]
  UploadDeadline(Duration),
  #[error("failed to persist variant url: {0}")]
  Persist(String),
}

impl JobError {
  pub fn stage(&self) -> Stage {
    match self {
      JobError::Provider(_) => Stage::Transform,
      JobError::Fetch(_) => Stage::Fetch,
      JobError::Upload(_) | JobError::UploadDeadline(_) => Stage::Upload,
      JobError::Persist(_) => Stage::Persist,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Pending,
  PrimaryRequested,
  PrimarySucceeded,
  PrimaryFailed,
  FallbackRequested,
  FallbackSucceeded,
  FallbackFailed,
  Persisting,
  Persisted,
  PersistFailed,
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      JobState::Persisted | JobState::PersistFailed | JobState::FallbackFailed
    )
  }
}

#[derive(Debug)]
pub enum JobOutcome {
  Persisted {
    url: String,
    tier: Tier,
  },
  PersistFailed {
    url: String,
    tier: Tier,
    error: JobError,
  },
  FallbackFailed {
    primary: JobError,
    fallback: JobError,
  },
}

impl JobOutcome {
  pub fn label(&self) -> &'static str {
    match self {
      JobOutcome::Persisted {
        tier: Tier::Primary,
        ..
      } => "persisted_primary",
      JobOutcome::Persisted {
        tier: Tier::Fallback,
        ..
      } => "persisted_fallback",
      JobOutcome::PersistFailed { .. } => "persist_failed",
      JobOutcome::FallbackFailed { .. } => "fallback_failed",
    }
  }
}

/// Collaborators shared by every variant job.
pub struct JobContext {
  pub primary: Arc<dyn Transformer>,
  pub fallback: Arc<dyn Transformer>,
  pub blob_sink: Arc<dyn BlobSink>,
  pub records: Arc<dyn RecordGateway>,
  /// Client for downloading primary results; carries its own timeout.
  pub http: reqwest::Client,
  pub upload_deadline: Duration,
  pub persist_attempts: u32,
  pub persist_backoff: Duration,
}

/// Derives one variant of one record: primary provider, then fallback on
/// any failure, then a single-field write of the resulting URL.
///
/// Never retries a provider. Errors end in a log line and an outcome, they
/// are never propagated.
pub struct VariantJob {
  record: Arc<ImageRecord>,
  spec: VariantSpec,
  ctx: Arc<JobContext>,
  state: JobState,
}

impl VariantJob {
  pub fn new(record: Arc<ImageRecord>, spec: VariantSpec, ctx: Arc<JobContext>) -> Self {
    Self {
      record,
      spec,
      ctx,
      state: JobState::Pending,
    }
  }

  pub fn state(&self) -> JobState {
    self.state
  }

  fn transition(&mut self, next: JobState) {
    debug_assert!(
      !self.state.is_terminal(),
      "transition out of terminal state {:?}",
      self.state
    );
    debug!(from = ?self.state, to = ?next, "variant job transition");
    self.state = next;
  }

  pub async fn run(mut self) -> JobOutcome {
    self.transition(JobState::PrimaryRequested);
    let primary = self.ctx.primary.clone();

    let (url, tier) = match self.derive(primary.as_ref()).await {
      Ok(url) => {
        self.transition(JobState::PrimarySucceeded);
        (url, Tier::Primary)
      }
      Err(primary_err) => {
        self.transition(JobState::PrimaryFailed);
        count_failure(Tier::Primary, &primary_err);
        warn!(
          provider = primary.name(),
          stage = %primary_err.stage(),
          error = %primary_err,
          "image resizing FALLBACK"
        );

        self.transition(JobState::FallbackRequested);
        let fallback = self.ctx.fallback.clone();
        match self.derive(fallback.as_ref()).await {
          Ok(url) => {
            self.transition(JobState::FallbackSucceeded);
            (url, Tier::Fallback)
          }
          Err(fallback_err) => {
            self.transition(JobState::FallbackFailed);
            count_failure(Tier::Fallback, &fallback_err);
            error!(
              provider = fallback.name(),
              stage = %fallback_err.stage(),
              error = %fallback_err,
              "all providers failed, variant left unchanged"
            );
            return self.finish(JobOutcome::FallbackFailed {
              primary: primary_err,
              fallback: fallback_err,
            });
          }
        }
      }
    };

    self.transition(JobState::Persisting);
    match self.persist(&url).await {
      Ok(()) => {
        self.transition(JobState::Persisted);
        info!(url = %url, tier = %tier, "resized photo stored");
        self.finish(JobOutcome::Persisted { url, tier })
      }
      Err(err) => {
        self.transition(JobState::PersistFailed);
        error!(
          orphaned_url = %url,
          tier = %tier,
          error = %err,
          "derived image exists but could not be linked to its record"
        );
        self.finish(JobOutcome::PersistFailed {
          url,
          tier,
          error: err,
        })
      }
    }
  }

  fn finish(&self, outcome: JobOutcome) -> JobOutcome {
    let labels = [
      ("variant", self.spec.field.to_string()),
      ("outcome", outcome.label().to_owned()),
    ];
    metrics::counter!("variant_jobs_total", &labels).increment(1);

    outcome
  }

  async fn derive(&self, provider: &dyn Transformer) -> Result<String, JobError> {
    let derivative = provider
      .transform(&self.record.original_url, self.spec.dimension)
      .await?;

    match derivative {
      Derivative::Hosted(url) => Ok(url),
      Derivative::Remote(url) => self.rehost(&url).await,
    }
  }

  /// Downloads a provider result and stores it in the blob sink.
  async fn rehost(&self, remote_url: &str) -> Result<String, JobError> {
    let response = self
      .ctx
      .http
      .get(remote_url)
      .send()
      .await
      .map_err(|e| JobError::Fetch(e.to_string()))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
      return Err(JobError::Fetch(format!(
        "received non 200 response code: {}",
        status.as_u16()
      )));
    }

    let mime = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .filter(|v| v.starts_with("image/"))
      .unwrap_or(DEFAULT_MIME)
      .to_owned();
    let key = object_name(self.record.parent_id);
    let deadline = self.ctx.upload_deadline;

    let upload = async {
      let data = response
        .bytes()
        .await
        .map_err(|e| JobError::Fetch(e.to_string()))?;

      self
        .ctx
        .blob_sink
        .upload_object(data, &key, &mime)
        .await
        .map_err(|e| JobError::Upload(format!("{:#}", e)))
    };

    let output = timeout(deadline, upload)
      .await
      .map_err(|_| JobError::UploadDeadline(deadline))??;

    debug!(key = %key, size = output.size, etag = %output.etag, "derivative uploaded");
    Ok(output.url)
  }

  async fn persist(&self, url: &str) -> Result<(), JobError> {
    let attempts = self.ctx.persist_attempts.max(1);
    let mut attempt = 1;

    loop {
      match self
        .ctx
        .records
        .update_field(self.record.id, self.spec.field, url)
        .await
      {
        Ok(()) => return Ok(()),
        Err(e) if attempt < attempts => {
          warn!(attempt, error = %e, "failed to persist variant url, retrying");
          attempt += 1;
          sleep(self.ctx.persist_backoff).await;
        }
        Err(e) => return Err(JobError::Persist(format!("{:#}", e))),
      }
    }
  }
}

fn count_failure(tier: Tier, err: &JobError) {
  let labels = [
    ("tier", tier.as_str().to_owned()),
    ("stage", err.stage().as_str().to_owned()),
  ];
  metrics::counter!("variant_provider_failures_total", &labels).increment(1);
}
