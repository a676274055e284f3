use super::crawl_job::{CrawlJobData, CrawlStatus};
use super::crawl_job_repository::CrawlJobRepository;
use crate::queue::job_queue::JobPriority;
use crate::queue::queue_manager::QueueManager;
use crate::settings::Settings;
use anyhow::Result;
use derive_builder::Builder;
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument};
use ulid::Ulid;

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct SubmitCrawlParameters {
  pub job_data: CrawlJobData,
  #[builder(default)]
  pub priority: JobPriority,
  #[builder(default = "Duration::ZERO")]
  pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SubmittedCrawl {
  pub crawl_id: String,
  pub job_id: Option<u64>,
  pub reused_existing: bool,
}

/// Ad-hoc crawl submission. A target with a still-active job folds onto the
/// existing crawl id instead of creating a second record.
pub struct CrawlService {
  settings: Arc<Settings>,
  queue_manager: Arc<QueueManager>,
  crawl_jobs: Arc<CrawlJobRepository>,
}

impl CrawlService {
  pub fn new(
    settings: Arc<Settings>,
    queue_manager: Arc<QueueManager>,
    crawl_jobs: Arc<CrawlJobRepository>,
  ) -> Self {
    Self {
      settings,
      queue_manager,
      crawl_jobs,
    }
  }

  #[instrument(skip(self, params), fields(target = params.job_data.target()))]
  pub async fn submit(&self, params: SubmitCrawlParameters) -> Result<SubmittedCrawl> {
    let mut job_data = params.job_data;
    job_data.apply_url_defaults();

    if let Some(existing) = self
      .crawl_jobs
      .find_active_for_target(job_data.domain.as_deref(), job_data.url.as_deref())
      .await?
    {
      info!(
        crawl_id = existing.crawl_id.as_str(),
        status = existing.crawl_status.to_string().as_str(),
        "Returning existing active crawl for target"
      );
      return Ok(SubmittedCrawl {
        crawl_id: existing.crawl_id,
        job_id: existing.job_id,
        reused_existing: true,
      });
    }

    let crawl_id = Ulid::new().to_string();
    let record = job_data.to_record(&crawl_id);
    let job_id = self
      .queue_manager
      .enqueue(
        &record,
        None,
        params.priority,
        params.delay,
        Duration::from_secs(self.settings.queue.ttr_seconds as u64),
      )
      .await?;

    self
      .crawl_jobs
      .insert(&crawl_id, Some(job_id), &job_data, CrawlStatus::Fresh)
      .await?;

    info!(
      crawl_id = crawl_id.as_str(),
      job_id, "Submitted new crawl job"
    );
    Ok(SubmittedCrawl {
      crawl_id,
      job_id: Some(job_id),
      reused_existing: false,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::job_queue::JobQueue;
  use crate::queue::queue_manager::CRAWL_TUBE;
  use crate::queue::sqlite_job_queue::SqliteJobQueue;
  use crate::settings::QueueSettings;
  use crate::sqlite::test_support;

  async fn service() -> (tempfile::TempDir, CrawlService) {
    let (dir, connection) = test_support::connection().await;
    let settings = Arc::new(Settings {
      queue: QueueSettings {
        ttr_seconds: 300,
        max_attempts: 3,
      },
      ..Default::default()
    });
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(Arc::clone(&connection)));
    let queue_manager = Arc::new(QueueManager::new(queue, 3, vec![CRAWL_TUBE.to_string()]));
    let crawl_jobs = Arc::new(CrawlJobRepository::new(connection));
    (dir, CrawlService::new(settings, queue_manager, crawl_jobs))
  }

  fn params(domain: &str) -> SubmitCrawlParameters {
    SubmitCrawlParametersBuilder::default()
      .job_data(CrawlJobData {
        domain: Some(domain.to_string()),
        max_pages: 5,
        ..Default::default()
      })
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_submit_enqueues_and_records() {
    let (_dir, service) = service().await;
    let submitted = service.submit(params("x.com")).await.unwrap();
    assert!(!submitted.reused_existing);
    assert!(submitted.job_id.is_some());

    let stats = service
      .queue_manager
      .queue()
      .stats_tube(CRAWL_TUBE)
      .await
      .unwrap();
    assert_eq!(stats.ready, 1);
  }

  #[tokio::test]
  async fn test_duplicate_submission_reuses_active_crawl() {
    let (_dir, service) = service().await;
    let first = service.submit(params("x.com")).await.unwrap();
    let second = service.submit(params("x.com")).await.unwrap();

    assert!(second.reused_existing);
    assert_eq!(second.crawl_id, first.crawl_id);

    // only one crawl message and one record
    let stats = service
      .queue_manager
      .queue()
      .stats_tube(CRAWL_TUBE)
      .await
      .unwrap();
    assert_eq!(stats.ready, 1);
  }

  #[tokio::test]
  async fn test_completed_target_gets_new_crawl() {
    let (_dir, service) = service().await;
    let first = service.submit(params("x.com")).await.unwrap();
    service
      .crawl_jobs
      .set_status(&first.crawl_id, CrawlStatus::Completed, None)
      .await
      .unwrap();

    let second = service.submit(params("x.com")).await.unwrap();
    assert!(!second.reused_existing);
    assert_ne!(second.crawl_id, first.crawl_id);
  }
}
