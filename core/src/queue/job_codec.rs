use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const SERIALIZER_VERSION: &str = "1.0";
pub const SERIALIZATION_FORMAT: &str = "json";

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("malformed job body: {0}")]
  Malformed(#[from] serde_json::Error),

  #[error("{kind} job missing required fields: {fields}")]
  MissingFields { kind: String, fields: String },
}

#[derive(
  Serialize,
  Deserialize,
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  strum_macros::Display,
  strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
  Crawl,
  Parse,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobMeta {
  pub serializer_version: String,
  pub created_at: DateTime<Utc>,
  pub format: String,
}

/// Self-describing queue job body. Fields not modeled here survive a
/// round-trip through `extra` for forward compatibility.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
  pub job_type: JobKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub crawl_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub domain: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_pages: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub single_url: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub use_sitemap: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cycle_id: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub document_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub html_file_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub headers_file_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub submitted_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub enqueued_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub retries: u32,
  #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<JobMeta>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl JobRecord {
  pub fn new(job_type: JobKind) -> Self {
    Self {
      job_type,
      crawl_id: None,
      domain: None,
      url: None,
      max_pages: None,
      single_url: None,
      use_sitemap: None,
      cycle_id: None,
      project_id: None,
      document_id: None,
      task_type: None,
      html_file_path: None,
      headers_file_path: None,
      submitted_at: None,
      enqueued_at: None,
      retries: 0,
      meta: None,
      extra: Map::new(),
    }
  }

  /// Submissions carrying only a crawl id are resolved against the state
  /// store by the consumer and skip field-level validation.
  pub fn is_lookup_only(&self) -> bool {
    self.crawl_id.is_some() && self.domain.is_none() && self.url.is_none() && self.max_pages.is_none()
  }
}

#[derive(Debug, Clone, Default)]
pub struct JobCodec;

impl JobCodec {
  pub fn new() -> Self {
    Self
  }

  pub fn encode(&self, record: &JobRecord) -> Result<Vec<u8>, CodecError> {
    let mut record = record.clone();
    record.meta = Some(JobMeta {
      serializer_version: SERIALIZER_VERSION.to_string(),
      created_at: Utc::now(),
      format: SERIALIZATION_FORMAT.to_string(),
    });
    self.validate(&record)?;
    Ok(serde_json::to_vec(&record)?)
  }

  pub fn decode(&self, bytes: &[u8]) -> Result<JobRecord, CodecError> {
    let record: JobRecord = serde_json::from_slice(bytes)?;
    if let Some(meta) = &record.meta {
      if meta.serializer_version != SERIALIZER_VERSION {
        warn!(
          found = meta.serializer_version.as_str(),
          expected = SERIALIZER_VERSION,
          "Job serializer version mismatch"
        );
      }
    }
    self.validate(&record)?;
    Ok(record)
  }

  fn validate(&self, record: &JobRecord) -> Result<(), CodecError> {
    let mut missing: Vec<&str> = Vec::new();
    match record.job_type {
      JobKind::Crawl => {
        if record.is_lookup_only() {
          return Ok(());
        }
        if record.domain.is_none() && record.url.is_none() {
          missing.push("domain or url");
        }
        if record.max_pages.is_none() {
          missing.push("max_pages");
        }
        if record.single_url.is_none() {
          missing.push("single_url");
        }
        if record.use_sitemap.is_none() {
          missing.push("use_sitemap");
        }
      }
      JobKind::Parse => {
        if record.document_id.is_none() {
          missing.push("document_id");
        }
        if record.html_file_path.is_none() {
          missing.push("html_file_path");
        }
        if record.task_type.is_none() {
          missing.push("task_type");
        }
      }
    }
    if missing.is_empty() {
      Ok(())
    } else {
      Err(CodecError::MissingFields {
        kind: record.job_type.to_string(),
        fields: missing.join(", "),
      })
    }
  }
}
