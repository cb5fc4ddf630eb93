use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::image_processing::VariantSpec;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
  Local,
  S3,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStoreType {
  Memory,
  Postgres,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
  pub app: AppConfig,
  pub storage: StorageConfig,
  pub records: RecordsConfig,
  pub providers: ProvidersConfig,
  #[serde(default)]
  pub jobs: JobsConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
  pub listen: String,
  pub metrics_listen: String,
  pub api_key: String,
  pub enable_openapi: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
  pub storage_type: StorageType,
  pub s3: Option<StorageConfigS3>,
  pub local: Option<StorageConfigLocal>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfigS3 {
  pub endpoint: String,
  pub bucket: String,
  pub access_key_id: String,
  pub secret_access_key: String,
  pub region: String,
  pub force_path_style: bool,
  pub base_url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfigLocal {
  pub path: String,
  pub base_url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RecordsConfig {
  pub record_store: RecordStoreType,
  pub postgres: Option<RecordsConfigPostgres>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RecordsConfigPostgres {
  pub url: String,
  #[serde(default = "default_max_connections")]
  pub max_connections: u32,
  #[serde(default)]
  pub ensure_schema: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProvidersConfig {
  pub primary: PrimaryProviderConfig,
  pub fallback: FallbackProviderConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PrimaryProviderConfig {
  #[serde(default = "default_primary_endpoint")]
  pub endpoint: String,
  #[serde(default)]
  pub api_key: String,
  #[serde(default)]
  pub api_secret: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FallbackProviderConfig {
  #[serde(default = "default_fallback_endpoint")]
  pub endpoint: String,
  #[serde(default)]
  pub api_key: String,
  #[serde(default = "default_fallback_cdn_base_url")]
  pub cdn_base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JobsConfig {
  pub upload_deadline_secs: u64,
  pub fetch_timeout_secs: u64,
  pub max_concurrent_jobs: usize,
  pub persist_attempts: u32,
  pub persist_backoff_ms: u64,
  pub shutdown_grace_secs: u64,
  pub variants: Option<Vec<VariantSpec>>,
}

impl Default for JobsConfig {
  fn default() -> Self {
    Self {
      upload_deadline_secs: 50,
      fetch_timeout_secs: 30,
      max_concurrent_jobs: 64,
      persist_attempts: 3,
      persist_backoff_ms: 500,
      shutdown_grace_secs: 60,
      variants: None,
    }
  }
}

impl JobsConfig {
  pub fn upload_deadline(&self) -> Duration {
    Duration::from_secs(self.upload_deadline_secs)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn persist_backoff(&self) -> Duration {
    Duration::from_millis(self.persist_backoff_ms)
  }

  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }

  /// Configured variants, or the large/medium/small defaults.
  pub fn variant_specs(&self) -> Vec<VariantSpec> {
    match &self.variants {
      Some(v) if !v.is_empty() => v.clone(),
      _ => VariantSpec::defaults().to_vec(),
    }
  }
}

fn default_max_connections() -> u32 {
  5
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_primary_endpoint() -> String {
  "https://api.kraken.io/v1/url".to_owned()
}

fn default_fallback_endpoint() -> String {
  "https://api.imageresizer.io/v1/images".to_owned()
}

fn default_fallback_cdn_base_url() -> String {
  "https://im.ages.io".to_owned()
}

pub fn parse(config_path: &str) -> Result<Config> {
  let toml_str = fs::read_to_string(config_path)
    .with_context(|| format!("failed to read config file: {}", config_path))?;

  from_toml(&toml_str)
}

pub fn from_toml(toml_str: &str) -> Result<Config> {
  let mut cfg: Config = toml::from_str(toml_str).context("failed to deserialize config")?;
  cfg.apply_env(|key| std::env::var(key).ok());
  cfg.validate()?;

  Ok(cfg)
}

impl Config {
  /// Fills provider credentials left empty in the file from the environment.
  pub fn apply_env<F>(&mut self, lookup: F)
  where
    F: Fn(&str) -> Option<String>,
  {
    let fill = |slot: &mut String, key: &str| {
      if slot.is_empty() {
        if let Some(value) = lookup(key) {
          *slot = value;
        }
      }
    };

    fill(&mut self.providers.primary.api_key, "KRAKEN_API_KEY");
    fill(&mut self.providers.primary.api_secret, "KRAKEN_API_SECRET");
    fill(&mut self.providers.fallback.api_key, "IMAGERESIZER_API_KEY");
  }

  fn validate(&self) -> Result<()> {
    match self.storage.storage_type {
      StorageType::S3 if self.storage.s3.is_none() => {
        return Err(anyhow!("S3 storage config is missing"))
      }
      StorageType::Local if self.storage.local.is_none() => {
        return Err(anyhow!("local storage config is missing"))
      }
      _ => {}
    }

    if self.records.record_store == RecordStoreType::Postgres && self.records.postgres.is_none() {
      return Err(anyhow!("postgres record store config is missing"));
    }

    if self.jobs.max_concurrent_jobs == 0 {
      return Err(anyhow!("jobs.max_concurrent_jobs must be at least 1"));
    }

    Ok(())
  }
}
