use super::parsed_document_repository::ParsedDocumentRepository;
use super::task_registry::TaskRegistry;
use crate::queue::job_codec::{JobKind, JobRecord};
use crate::queue::queue_manager::{parser_tube, QueueManager};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};

/// Fields too large to travel in a fan-out payload; parsers read the HTML
/// from `html_file_path` instead.
const DROPPED_FIELDS: [&str; 4] = ["html", "body", "raw_content", "response_headers"];

/// One persisted page as handed over by the crawl engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PageItem {
  pub url: String,
  pub domain: Option<String>,
  pub crawl_id: Option<String>,
  pub html_file_path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub headers_file_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<u16>,
  #[serde(flatten)]
  pub custom: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct DispatchSummary {
  pub document_id: String,
  pub jobs_dispatched: u32,
  pub jobs_failed: u32,
  pub parser_job_ids: Vec<u64>,
}

/// Strips the large payload fields and anything invalid as UTF-8 text from
/// the custom map before the item is persisted or enqueued.
pub fn sanitize_item(item: &PageItem) -> PageItem {
  let mut sanitized = item.clone();
  for field in DROPPED_FIELDS {
    sanitized.custom.remove(field);
  }
  sanitized
}

/// Fans one persisted page out to every registered parser task type.
pub struct ParseJobDispatcher {
  queue_manager: Arc<QueueManager>,
  documents: Arc<ParsedDocumentRepository>,
  registry: Arc<TaskRegistry>,
}

impl ParseJobDispatcher {
  pub fn new(
    queue_manager: Arc<QueueManager>,
    documents: Arc<ParsedDocumentRepository>,
    registry: Arc<TaskRegistry>,
  ) -> Self {
    Self {
      queue_manager,
      documents,
      registry,
    }
  }

  fn parse_record(&self, item: &PageItem, document_id: &str, task_type: &str) -> JobRecord {
    let mut record = JobRecord::new(JobKind::Parse);
    record.crawl_id = item.crawl_id.clone();
    record.domain = item.domain.clone();
    record.url = Some(item.url.clone());
    record.document_id = Some(document_id.to_string());
    record.task_type = Some(task_type.to_string());
    record.html_file_path = Some(item.html_file_path.clone());
    record.headers_file_path = item.headers_file_path.clone();
    record.enqueued_at = Some(Utc::now());
    record.extra = item.custom.clone();
    record
  }

  /// Seeds the parsed document, enqueues one job per task type, and records
  /// the dispatch accounting. A seed-insert failure is fatal for the page;
  /// individual enqueue failures are counted and logged, and the final
  /// accounting update always runs.
  #[instrument(skip(self, item), fields(url = item.url.as_str()))]
  pub async fn dispatch_page(&self, item: &PageItem) -> Result<DispatchSummary> {
    let item = sanitize_item(item);
    let document_id = self
      .documents
      .insert_seed(&item)
      .await
      .context("Failed to seed parsed document, aborting page dispatch")?;

    let mut jobs_dispatched = 0u32;
    let mut jobs_failed = 0u32;
    let mut parser_job_ids = Vec::new();

    for (task_type, task) in self.registry.tasks() {
      let record = self.parse_record(&item, &document_id, task_type);
      let tube = parser_tube(task_type);
      match self
        .queue_manager
        .enqueue(
          &record,
          Some(&tube),
          task.settings.priority,
          Duration::ZERO,
          task.settings.ttr,
        )
        .await
      {
        Ok(job_id) => {
          jobs_dispatched += 1;
          parser_job_ids.push(job_id);
        }
        Err(e) => {
          error!(
            document_id = document_id.as_str(),
            task_type,
            tube = tube.as_str(),
            error = e.to_string(),
            "Failed to dispatch parser job"
          );
          jobs_failed += 1;
        }
      }
    }

    if jobs_failed > 0 {
      warn!(
        document_id = document_id.as_str(),
        jobs_dispatched, jobs_failed, "Completed dispatch with failures"
      );
    } else {
      info!(
        document_id = document_id.as_str(),
        jobs_dispatched, "Dispatched all parser jobs"
      );
    }

    self
      .documents
      .record_dispatch(&document_id, jobs_dispatched, jobs_failed, &parser_job_ids)
      .await?;

    Ok(DispatchSummary {
      document_id,
      jobs_dispatched,
      jobs_failed,
      parser_job_ids,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::parsed_document_repository::STATUS_DISPATCH_COMPLETE;
  use crate::queue::job_queue::{
    JobQueue, JobStats, PeekedJob, QueueError, QueueStats, ReservedJob, TubeStats,
  };
  use crate::queue::queue_manager::CRAWL_TUBE;
  use crate::queue::sqlite_job_queue::SqliteJobQueue;
  use crate::sqlite::test_support;
  use async_trait::async_trait;

  fn page_item() -> PageItem {
    let mut custom = Map::new();
    custom.insert("html".to_string(), serde_json::json!("<html>big</html>"));
    custom.insert("depth".to_string(), serde_json::json!(2));
    PageItem {
      url: "https://example.com/a".to_string(),
      domain: Some("example.com".to_string()),
      crawl_id: Some("c-1".to_string()),
      html_file_path: "/tmp/a.html".to_string(),
      headers_file_path: Some("/tmp/a.html.headers.json".to_string()),
      status: Some(200),
      custom,
    }
  }

  #[test]
  fn test_sanitize_drops_large_fields_only() {
    let sanitized = sanitize_item(&page_item());
    assert!(!sanitized.custom.contains_key("html"));
    assert_eq!(sanitized.custom.get("depth"), Some(&serde_json::json!(2)));
  }

  /// Delegating queue that refuses puts into one tube, for exercising the
  /// partial-dispatch accounting.
  struct FailingTubeQueue {
    inner: SqliteJobQueue,
    failing_tube: String,
  }

  #[async_trait]
  impl JobQueue for FailingTubeQueue {
    async fn put(
      &self,
      tube: &str,
      body: &[u8],
      priority: u32,
      delay: Duration,
      ttr: Duration,
    ) -> Result<u64, QueueError> {
      if tube == self.failing_tube {
        return Err(QueueError::Connection("tube unavailable".to_string()));
      }
      self.inner.put(tube, body, priority, delay, ttr).await
    }

    async fn reserve(
      &self,
      tubes: &[String],
      timeout: Duration,
    ) -> Result<Option<ReservedJob>, QueueError> {
      self.inner.reserve(tubes, timeout).await
    }

    async fn touch(&self, job_id: u64) -> Result<bool, QueueError> {
      self.inner.touch(job_id).await
    }

    async fn delete(&self, job_id: u64) -> Result<(), QueueError> {
      self.inner.delete(job_id).await
    }

    async fn release(&self, job_id: u64, priority: u32, delay: Duration) -> Result<(), QueueError> {
      self.inner.release(job_id, priority, delay).await
    }

    async fn bury(&self, job_id: u64, priority: u32) -> Result<(), QueueError> {
      self.inner.bury(job_id, priority).await
    }

    async fn kick(&self, tube: &str, bound: u32) -> Result<u32, QueueError> {
      self.inner.kick(tube, bound).await
    }

    async fn peek_ready(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError> {
      self.inner.peek_ready(tube).await
    }

    async fn peek_delayed(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError> {
      self.inner.peek_delayed(tube).await
    }

    async fn peek_buried(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError> {
      self.inner.peek_buried(tube).await
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats, QueueError> {
      self.inner.stats_tube(tube).await
    }

    async fn stats_job(&self, job_id: u64) -> Result<Option<JobStats>, QueueError> {
      self.inner.stats_job(job_id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
      self.inner.stats().await
    }
  }

  async fn dispatcher_with_queue(
    queue: Arc<dyn JobQueue>,
  ) -> (tempfile::TempDir, ParseJobDispatcher, Arc<ParsedDocumentRepository>) {
    let (dir, connection) = test_support::connection().await;
    let registry = Arc::new(TaskRegistry::with_defaults());
    let queue_manager = Arc::new(QueueManager::new(queue, 3, vec![CRAWL_TUBE.to_string()]));
    let documents = Arc::new(ParsedDocumentRepository::new(connection));
    let dispatcher = ParseJobDispatcher::new(queue_manager, Arc::clone(&documents), registry);
    (dir, dispatcher, documents)
  }

  #[tokio::test]
  async fn test_dispatch_fans_out_to_every_task_type() {
    let (_queue_dir, queue_connection) = test_support::connection().await;
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(queue_connection));
    let (_dir, dispatcher, documents) = dispatcher_with_queue(Arc::clone(&queue)).await;
    let task_count = TaskRegistry::with_defaults().len() as u32;

    let summary = dispatcher.dispatch_page(&page_item()).await.unwrap();
    assert_eq!(summary.jobs_dispatched, task_count);
    assert_eq!(summary.jobs_failed, 0);
    assert_eq!(summary.parser_job_ids.len(), task_count as usize);

    let document = documents.find(&summary.document_id).await.unwrap().unwrap();
    assert_eq!(document.processing_status, STATUS_DISPATCH_COMPLETE);
    assert_eq!(document.jobs_dispatched_total, task_count);
    assert!(!document.item.contains_key("html"));
  }

  #[tokio::test]
  async fn test_dispatch_counts_failed_tube_and_still_records() {
    let (_queue_dir, queue_connection) = test_support::connection().await;
    let failing_tube = parser_tube("headings_extraction");
    let queue: Arc<dyn JobQueue> = Arc::new(FailingTubeQueue {
      inner: SqliteJobQueue::new(queue_connection),
      failing_tube,
    });
    let (_dir, dispatcher, documents) = dispatcher_with_queue(queue).await;
    let task_count = TaskRegistry::with_defaults().len() as u32;

    let summary = dispatcher.dispatch_page(&page_item()).await.unwrap();
    assert_eq!(summary.jobs_dispatched, task_count - 1);
    assert_eq!(summary.jobs_failed, 1);

    let document = documents.find(&summary.document_id).await.unwrap().unwrap();
    assert_eq!(document.processing_status, STATUS_DISPATCH_COMPLETE);
    assert_eq!(document.jobs_failed_dispatch, 1);
    assert_eq!(document.jobs_dispatched_total, task_count - 1);
  }
}
