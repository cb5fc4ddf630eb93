use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;

use super::RecordGateway;
use crate::image_processing::{ImageRecord, RecordId, VariantField};

#[derive(Debug, FromRow)]
struct PhotoRow {
  id_photo: i64,
  id_ad: i64,
  url_original: Option<String>,
  url_small: Option<String>,
  url_medium: Option<String>,
  url_large: Option<String>,
}

impl From<PhotoRow> for ImageRecord {
  fn from(row: PhotoRow) -> Self {
    ImageRecord {
      id: row.id_photo,
      parent_id: row.id_ad,
      original_url: row.url_original.unwrap_or_default(),
      small_url: row.url_small,
      medium_url: row.url_medium,
      large_url: row.url_large,
    }
  }
}

/// Record gateway over the `t_photo` table.
pub struct PostgresRecords {
  pool: PgPool,
}

impl PostgresRecords {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
    let pool = PgPoolOptions::new()
      .max_connections(max_connections)
      .connect_lazy(url)
      .context("invalid postgres url")?;

    Ok(Self::new(pool))
  }

  pub async fn ensure_schema(&self) -> Result<()> {
    sqlx::query(
      r#"
      CREATE TABLE IF NOT EXISTS t_photo (
        id_photo BIGSERIAL PRIMARY KEY,
        id_ad BIGINT NOT NULL DEFAULT 0,
        url_original TEXT,
        url_small TEXT,
        url_medium TEXT,
        url_large TEXT
      )
      "#,
    )
    .execute(&self.pool)
    .await?;

    info!("record schema ready");
    Ok(())
  }
}

#[async_trait]
impl RecordGateway for PostgresRecords {
  async fn load(&self, id: RecordId) -> Result<ImageRecord> {
    let row: Option<PhotoRow> = sqlx::query_as::<_, PhotoRow>(
      r#"
      SELECT id_photo, id_ad, url_original, url_small, url_medium, url_large
      FROM t_photo
      WHERE id_photo = $1
      "#,
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await
    .with_context(|| format!("failed to load record {}", id))?;

    Ok(row.map(ImageRecord::from).unwrap_or_default())
  }

  async fn update_field(&self, id: RecordId, field: VariantField, value: &str) -> Result<()> {
    // Column names come from a closed enum, never from input.
    let sql = format!("UPDATE t_photo SET {} = $1 WHERE id_photo = $2", field.column());

    let res = sqlx::query(&sql)
      .bind(value)
      .bind(id)
      .execute(&self.pool)
      .await
      .with_context(|| format!("failed to update {} of record {}", field.column(), id))?;

    if res.rows_affected() == 0 {
      return Err(anyhow!("record {} does not exist", id));
    }

    Ok(())
  }

  async fn create(&self, parent_id: i64, original_url: &str) -> Result<RecordId> {
    let id: i64 =
      sqlx::query_scalar("INSERT INTO t_photo (id_ad, url_original) VALUES ($1, $2) RETURNING id_photo")
        .bind(parent_id)
        .bind(original_url)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert record")?;

    Ok(id)
  }
}
