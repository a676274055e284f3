use serde_json::Value;
use thiserror::Error;

/// Task outcomes the worker runtime can act on. Retry releases the job with
/// backoff, Fail buries it, Skip completes it without writing a result.
#[derive(Debug, Error)]
pub enum TaskError {
  #[error("retryable: {0}")]
  Retry(String),

  #[error("failed: {0}")]
  Fail(String),

  #[error("skipped: {0}")]
  Skip(String),
}

#[derive(Debug, Clone)]
pub struct TaskContext {
  pub document_id: String,
  pub url: String,
  pub domain: Option<String>,
}

/// One page-analysis capability. Implementations are pure extraction over
/// the already-persisted HTML; the runtime owns I/O and the job lifecycle.
pub trait TaskHandler: Send + Sync {
  /// Tag identifying this analysis; also names its tube.
  fn task_type(&self) -> &'static str;

  /// The document field the extracted value is written under.
  fn field_name(&self) -> &'static str;

  fn extract(&self, html: &str, ctx: &TaskContext) -> Result<Value, TaskError>;
}
