use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

mod dispatcher;
mod job;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::Dispatcher;
pub use job::{JobContext, JobError, JobOutcome, JobState, Stage, Tier, VariantJob};

pub type RecordId = i64;

/// A stored source image and the locations of its derived variants.
///
/// The zero value doubles as the "not found" record: an empty
/// `original_url` makes every variant job fail before any network call.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRecord {
  pub id: RecordId,
  pub parent_id: i64,
  pub original_url: String,
  pub small_url: Option<String>,
  pub medium_url: Option<String>,
  pub large_url: Option<String>,
}

impl ImageRecord {
  pub fn variant_url(&self, field: VariantField) -> Option<&str> {
    match field {
      VariantField::Small => self.small_url.as_deref(),
      VariantField::Medium => self.medium_url.as_deref(),
      VariantField::Large => self.large_url.as_deref(),
    }
  }

  pub fn set_variant_url(&mut self, field: VariantField, url: String) {
    match field {
      VariantField::Small => self.small_url = Some(url),
      VariantField::Medium => self.medium_url = Some(url),
      VariantField::Large => self.large_url = Some(url),
    }
  }
}

/// Record field a variant job owns. Each field has exactly one writer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VariantField {
  Small,
  Medium,
  Large,
}

impl VariantField {
  pub fn column(self) -> &'static str {
    match self {
      VariantField::Small => "url_small",
      VariantField::Medium => "url_medium",
      VariantField::Large => "url_large",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      VariantField::Small => "small",
      VariantField::Medium => "medium",
      VariantField::Large => "large",
    }
  }
}

impl fmt::Display for VariantField {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSpec {
  pub field: VariantField,
  pub dimension: u32,
}

const DEFAULT_VARIANTS: [VariantSpec; 3] = [
  VariantSpec {
    field: VariantField::Large,
    dimension: 1280,
  },
  VariantSpec {
    field: VariantField::Medium,
    dimension: 960,
  },
  VariantSpec {
    field: VariantField::Small,
    dimension: 640,
  },
];

impl VariantSpec {
  pub fn defaults() -> &'static [VariantSpec] {
    &DEFAULT_VARIANTS
  }
}

/// Blob name for a derived image: `<parent_id>-<unix nanos>`.
pub fn object_name(parent_id: i64) -> String {
  let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
  format!("{}-{}", parent_id, nanos)
}
