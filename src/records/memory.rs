use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::RecordGateway;
use crate::image_processing::{ImageRecord, RecordId, VariantField};

/// Process-local record store.
#[derive(Default)]
pub struct MemoryRecords {
  inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
  next_id: RecordId,
  records: HashMap<RecordId, ImageRecord>,
}

impl MemoryRecords {
  pub fn insert(&self, record: ImageRecord) {
    let mut inner = self.inner.write();
    inner.next_id = inner.next_id.max(record.id);
    inner.records.insert(record.id, record);
  }

  pub fn get(&self, id: RecordId) -> Option<ImageRecord> {
    self.inner.read().records.get(&id).cloned()
  }
}

#[async_trait]
impl RecordGateway for MemoryRecords {
  async fn load(&self, id: RecordId) -> Result<ImageRecord> {
    Ok(self.get(id).unwrap_or_default())
  }

  async fn update_field(&self, id: RecordId, field: VariantField, value: &str) -> Result<()> {
    let mut inner = self.inner.write();
    let record = inner
      .records
      .get_mut(&id)
      .ok_or_else(|| anyhow!("record {} does not exist", id))?;

    record.set_variant_url(field, value.to_owned());
    Ok(())
  }

  async fn create(&self, parent_id: i64, original_url: &str) -> Result<RecordId> {
    let mut inner = self.inner.write();
    inner.next_id += 1;
    let id = inner.next_id;

    inner.records.insert(
      id,
      ImageRecord {
        id,
        parent_id,
        original_url: original_url.to_owned(),
        ..ImageRecord::default()
      },
    );

    Ok(id)
  }
}
