use super::parse_job_dispatcher::PageItem;
use super::parsed_document_repository::ParsedDocumentRepository;
use super::task_handler::{TaskContext, TaskError, TaskHandler};
use super::task_registry::RegisteredTask;
use crate::files::content_store::ContentStore;
use crate::queue::job_codec::{JobKind, JobRecord};
use crate::queue::queue_manager::{parser_tube, QueueManager};
use anyhow::Result;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_secs(30);
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Generic reserve/validate/dispatch/finalize loop around one task handler.
/// Concurrency comes from running N independent instances per task type.
pub struct ParseWorker {
  instance_id: u32,
  tube: String,
  handler: Arc<dyn TaskHandler>,
  queue_manager: Arc<QueueManager>,
  documents: Arc<ParsedDocumentRepository>,
  content_store: Arc<ContentStore>,
}

fn page_item_from_record(record: &JobRecord) -> PageItem {
  PageItem {
    url: record.url.clone().unwrap_or_default(),
    domain: record.domain.clone(),
    crawl_id: record.crawl_id.clone(),
    html_file_path: record.html_file_path.clone().unwrap_or_default(),
    headers_file_path: record.headers_file_path.clone(),
    status: None,
    custom: record.extra.clone(),
  }
}

impl ParseWorker {
  pub fn new(
    instance_id: u32,
    task: &RegisteredTask,
    queue_manager: Arc<QueueManager>,
    documents: Arc<ParsedDocumentRepository>,
    content_store: Arc<ContentStore>,
  ) -> Self {
    Self {
      instance_id,
      tube: parser_tube(task.handler.task_type()),
      handler: Arc::clone(&task.handler),
      queue_manager,
      documents,
      content_store,
    }
  }

  fn validate(&self, job_id: u64, record: &JobRecord) -> bool {
    if record.job_type != JobKind::Parse {
      error!(job_id, "Job is not a parse job");
      return false;
    }
    for (key, present) in [
      ("document_id", record.document_id.is_some()),
      ("html_file_path", record.html_file_path.is_some()),
      ("task_type", record.task_type.is_some()),
    ] {
      if !present {
        error!(job_id, key, "Missing critical key in job data");
        return false;
      }
    }
    if record.task_type.as_deref() != Some(self.handler.task_type()) {
      error!(
        job_id,
        job_task_type = record.task_type.as_deref().unwrap_or(""),
        worker_task_type = self.handler.task_type(),
        "Job task type does not match worker"
      );
      return false;
    }
    true
  }

  /// Processes at most one job. Returns false when the reserve timed out.
  #[instrument(skip(self), fields(task_type = self.handler.task_type(), instance_id = self.instance_id))]
  pub async fn execute(&self) -> Result<bool> {
    let Some((job_id, record, lease)) = self
      .queue_manager
      .dequeue(&[self.tube.clone()], RESERVE_TIMEOUT)
      .await?
    else {
      return Ok(false);
    };

    if !self.validate(job_id, &record) {
      self.queue_manager.fail(&lease, &record, true).await?;
      return Ok(true);
    }

    let document_id = record.document_id.clone().unwrap_or_default();
    let html_file_path = record.html_file_path.clone().unwrap_or_default();

    if !Path::new(&html_file_path).exists() {
      error!(
        job_id,
        document_id = document_id.as_str(),
        path = html_file_path.as_str(),
        "HTML file not found, burying job"
      );
      self.queue_manager.fail(&lease, &record, true).await?;
      return Ok(true);
    }

    let html_bytes = match self.content_store.read(Path::new(&html_file_path)).await {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(
          job_id,
          error = e.to_string(),
          "Failed to read HTML file, releasing for retry"
        );
        self
          .queue_manager
          .retry(&lease, &record, RETRY_DELAY, None)
          .await?;
        return Ok(true);
      }
    };
    let html = String::from_utf8_lossy(&html_bytes).into_owned();

    let ctx = TaskContext {
      document_id: document_id.clone(),
      url: record.url.clone().unwrap_or_default(),
      domain: record.domain.clone(),
    };

    match self.handler.extract(&html, &ctx) {
      Ok(value) => {
        let item = page_item_from_record(&record);
        if let Err(e) = self
          .documents
          .upsert_task_result(
            &document_id,
            self.handler.field_name(),
            self.handler.task_type(),
            value,
            &item,
          )
          .await
        {
          error!(
            job_id,
            error = e.to_string(),
            "Failed to persist task result, releasing for retry"
          );
          self
            .queue_manager
            .retry(&lease, &record, RETRY_DELAY, None)
            .await?;
          return Ok(true);
        }
        info!(job_id, document_id = document_id.as_str(), "Processed parse job");
        self.queue_manager.complete(&lease, &record).await?;
      }
      Err(TaskError::Retry(reason)) => {
        warn!(job_id, reason = reason.as_str(), "Retryable task error, releasing");
        self
          .queue_manager
          .retry(&lease, &record, RETRY_DELAY, None)
          .await?;
      }
      Err(TaskError::Skip(reason)) => {
        info!(job_id, reason = reason.as_str(), "Task elected to skip page");
        self
          .documents
          .record_task_completion(&document_id, self.handler.task_type())
          .await?;
        self.queue_manager.complete(&lease, &record).await?;
      }
      Err(TaskError::Fail(reason)) => {
        error!(job_id, reason = reason.as_str(), "Task failed, burying job");
        self.queue_manager.fail(&lease, &record, true).await?;
      }
    }

    Ok(true)
  }

  /// Reserve/process loop. Shutdown is observed between jobs so an
  /// in-flight job is always finalized before the loop exits.
  pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(
      task_type = self.handler.task_type(),
      instance_id = self.instance_id,
      tube = self.tube.as_str(),
      "Parser worker started"
    );
    while !*shutdown.borrow() {
      if let Err(e) = self.execute().await {
        error!(
          task_type = self.handler.task_type(),
          error = e.to_string(),
          "Error in parser worker loop"
        );
        sleep(LOOP_ERROR_BACKOFF).await;
      }
    }
    info!(
      task_type = self.handler.task_type(),
      instance_id = self.instance_id,
      "Parser worker stopped"
    );
    Ok(())
  }
}
