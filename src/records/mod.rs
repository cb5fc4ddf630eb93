use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{RecordStoreType, RecordsConfig};
use crate::image_processing::{ImageRecord, RecordId, VariantField};

mod memory;
mod postgres;

pub use memory::MemoryRecords;
pub use postgres::PostgresRecords;

/// Reads and writes image records by identifier.
#[async_trait]
pub trait RecordGateway: Send + Sync {
  /// Returns the zero-value record when `id` does not exist.
  async fn load(&self, id: RecordId) -> Result<ImageRecord>;

  /// Writes `value` into exactly one variant column of record `id`.
  async fn update_field(&self, id: RecordId, field: VariantField, value: &str) -> Result<()>;

  /// Inserts a record for an ad-hoc source URL and returns its id.
  async fn create(&self, parent_id: i64, original_url: &str) -> Result<RecordId>;
}

pub async fn from_config(cfg: &RecordsConfig) -> Result<Arc<dyn RecordGateway>> {
  let gateway: Arc<dyn RecordGateway> = match cfg.record_store {
    RecordStoreType::Memory => Arc::new(MemoryRecords::default()),
    RecordStoreType::Postgres => {
      let pg = match &cfg.postgres {
        Some(pg) => pg,
        None => return Err(anyhow!("postgres record store config is missing")),
      };

      let records = PostgresRecords::connect_lazy(&pg.url, pg.max_connections)?;
      if pg.ensure_schema {
        records
          .ensure_schema()
          .await
          .context("failed to ensure record schema")?;
      }
      Arc::new(records)
    }
  };

  Ok(gateway)
}
