use super::{
  job_codec::{JobCodec, JobKind, JobRecord},
  job_queue::{JobPriority, JobQueue, QueueStats},
};
use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};

pub const CRAWL_TUBE: &str = "crawler_crawl_jobs";

const MAX_PURGE_PEEKS: u32 = 5;
const MAX_BACKOFF_SECONDS: u64 = 30 * 60;

pub fn parser_tube(task_type: &str) -> String {
  format!("crawler_htmlparser_{}_tube", task_type)
}

/// Opaque handle for finalizing a dequeued job.
#[derive(Debug, Clone)]
pub struct JobLease {
  pub job_id: u64,
  pub tube: String,
}

pub struct QueueManager {
  queue: Arc<dyn JobQueue>,
  codec: JobCodec,
  max_attempts: u32,
  purge_tubes: Vec<String>,
}

impl QueueManager {
  pub fn new(queue: Arc<dyn JobQueue>, max_attempts: u32, purge_tubes: Vec<String>) -> Self {
    Self {
      queue,
      codec: JobCodec::new(),
      max_attempts,
      purge_tubes,
    }
  }

  pub fn queue(&self) -> &Arc<dyn JobQueue> {
    &self.queue
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  fn tube_for(&self, record: &JobRecord) -> Result<String> {
    match record.job_type {
      JobKind::Crawl => Ok(CRAWL_TUBE.to_string()),
      JobKind::Parse => record
        .task_type
        .as_deref()
        .map(parser_tube)
        .ok_or_else(|| anyhow!("Parse job missing task_type, cannot derive tube")),
    }
  }

  #[instrument(skip(self, record))]
  pub async fn enqueue(
    &self,
    record: &JobRecord,
    tube: Option<&str>,
    priority: JobPriority,
    delay: Duration,
    ttr: Duration,
  ) -> Result<u64> {
    let tube = match tube {
      Some(tube) => tube.to_string(),
      None => self.tube_for(record)?,
    };
    let body = self.codec.encode(record)?;
    let job_id = self
      .queue
      .put(&tube, &body, priority.value(), delay, ttr)
      .await?;
    info!(
      job_id,
      tube = tube.as_str(),
      priority = priority.value(),
      "Enqueued job"
    );
    Ok(job_id)
  }

  /// Reserves the next job from `tubes`. A malformed body is buried and the
  /// slot reported empty; the caller just loops.
  #[instrument(skip(self))]
  pub async fn dequeue(
    &self,
    tubes: &[String],
    timeout: Duration,
  ) -> Result<Option<(u64, JobRecord, JobLease)>> {
    let Some(job) = self.queue.reserve(tubes, timeout).await? else {
      return Ok(None);
    };

    match self.codec.decode(&job.body) {
      Ok(record) => {
        debug!(job_id = job.id, "Dequeued job");
        let lease = JobLease {
          job_id: job.id,
          tube: job.tube,
        };
        Ok(Some((job.id, record, lease)))
      }
      Err(e) => {
        error!(
          job_id = job.id,
          error = e.to_string(),
          "Failed to decode job body, burying"
        );
        self
          .queue
          .bury(job.id, JobPriority::Normal.value())
          .await?;
        Ok(None)
      }
    }
  }

  /// Deletes a finished job, then sweeps the purge tubes for ready
  /// duplicates carrying the same crawl id. Parser fan-out tubes are never
  /// swept; their jobs legitimately share the crawl id.
  #[instrument(skip(self, record))]
  pub async fn complete(&self, lease: &JobLease, record: &JobRecord) -> Result<()> {
    self.queue.delete(lease.job_id).await?;
    info!(job_id = lease.job_id, "Completed and deleted job");

    if let Some(crawl_id) = &record.crawl_id {
      self.purge_duplicates(crawl_id).await;
    }
    Ok(())
  }

  async fn purge_duplicates(&self, crawl_id: &str) {
    for tube in &self.purge_tubes {
      for _ in 0..MAX_PURGE_PEEKS {
        let peeked = match self.queue.peek_ready(tube).await {
          Ok(Some(peeked)) => peeked,
          Ok(None) => break,
          Err(e) => {
            warn!(
              tube = tube.as_str(),
              error = e.to_string(),
              "Error peeking ready jobs during purge"
            );
            break;
          }
        };
        let matches = self
          .codec
          .decode(&peeked.body)
          .ok()
          .and_then(|record| record.crawl_id)
          .map(|id| id == crawl_id)
          .unwrap_or(false);
        if !matches {
          break;
        }
        info!(
          job_id = peeked.id,
          crawl_id, "Purging stale duplicate job"
        );
        if self.queue.delete(peeked.id).await.is_err() {
          break;
        }
      }
    }
  }

  /// Releases the job for another attempt, unless the broker's release
  /// counter already reached the attempt bound, in which case the job is
  /// buried instead.
  #[instrument(skip(self, record))]
  pub async fn retry(
    &self,
    lease: &JobLease,
    record: &JobRecord,
    delay: Duration,
    priority: Option<JobPriority>,
  ) -> Result<()> {
    let stats = self.queue.stats_job(lease.job_id).await?;
    let (releases, current_priority) = stats
      .map(|s| (s.releases, s.priority))
      .unwrap_or((0, JobPriority::Normal.value()));

    if releases >= self.max_attempts {
      error!(
        job_id = lease.job_id,
        releases, "Job exceeded max retries, burying"
      );
      self.queue.bury(lease.job_id, current_priority).await?;
      return Ok(());
    }

    let priority = priority.map(|p| p.value()).unwrap_or(current_priority);
    self.queue.release(lease.job_id, priority, delay).await?;
    info!(
      job_id = lease.job_id,
      delay_seconds = delay.as_secs(),
      attempt = releases + 1,
      "Released job for retry"
    );
    Ok(())
  }

  /// Buries on permanent failure or exhausted attempts; otherwise deletes
  /// the broker job and re-puts the body with `retries` incremented and an
  /// exponential backoff delay.
  #[instrument(skip(self, record))]
  pub async fn fail(&self, lease: &JobLease, record: &JobRecord, permanent: bool) -> Result<()> {
    let attempts = record.retries + 1;

    if permanent || attempts > self.max_attempts {
      self
        .queue
        .bury(lease.job_id, JobPriority::Normal.value())
        .await?;
      info!(
        job_id = lease.job_id,
        attempts, permanent, "Buried failed job"
      );
      return Ok(());
    }

    let delay_seconds = MAX_BACKOFF_SECONDS.min(5 * 2u64.pow(attempts));
    let ttr_seconds = self
      .queue
      .stats_job(lease.job_id)
      .await?
      .map(|s| s.ttr_seconds)
      .unwrap_or(60);

    let mut updated = record.clone();
    updated.retries = attempts;
    let body = self.codec.encode(&updated)?;

    self.queue.delete(lease.job_id).await?;
    let new_job_id = self
      .queue
      .put(
        &lease.tube,
        &body,
        JobPriority::Normal.value(),
        Duration::from_secs(delay_seconds),
        Duration::from_secs(ttr_seconds as u64),
      )
      .await?;
    info!(
      job_id = lease.job_id,
      new_job_id, delay_seconds, attempt = attempts, "Rescheduled failed job"
    );
    Ok(())
  }

  pub async fn get_stats(&self) -> Result<QueueStats> {
    Ok(self.queue.stats().await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::sqlite_job_queue::SqliteJobQueue;
  use crate::sqlite::test_support;

  const TTR: Duration = Duration::from_secs(60);

  async fn manager() -> (tempfile::TempDir, QueueManager) {
    let (dir, connection) = test_support::connection().await;
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(connection));
    let manager = QueueManager::new(queue, 3, vec![CRAWL_TUBE.to_string()]);
    (dir, manager)
  }

  fn crawl_record(crawl_id: &str) -> JobRecord {
    let mut record = JobRecord::new(JobKind::Crawl);
    record.crawl_id = Some(crawl_id.to_string());
    record.domain = Some("example.com".to_string());
    record.max_pages = Some(5);
    record.single_url = Some(false);
    record.use_sitemap = Some(false);
    record
  }

  #[tokio::test]
  async fn test_enqueue_derives_tube_from_kind() {
    let (_dir, manager) = manager().await;
    let record = crawl_record("c-1");
    manager
      .enqueue(&record, None, JobPriority::High, Duration::ZERO, TTR)
      .await
      .unwrap();

    let stats = manager.queue().stats_tube(CRAWL_TUBE).await.unwrap();
    assert_eq!(stats.ready, 1);
  }

  #[tokio::test]
  async fn test_dequeue_roundtrip() {
    let (_dir, manager) = manager().await;
    let record = crawl_record("c-2");
    let job_id = manager
      .enqueue(&record, None, JobPriority::Normal, Duration::ZERO, TTR)
      .await
      .unwrap();

    let (dequeued_id, dequeued, _lease) = manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(dequeued_id, job_id);
    assert_eq!(dequeued.crawl_id.as_deref(), Some("c-2"));
  }

  #[tokio::test]
  async fn test_malformed_body_is_buried() {
    let (_dir, manager) = manager().await;
    manager
      .queue()
      .put(CRAWL_TUBE, b"{not json", 100, Duration::ZERO, TTR)
      .await
      .unwrap();

    let dequeued = manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap();
    assert!(dequeued.is_none());

    let stats = manager.queue().stats_tube(CRAWL_TUBE).await.unwrap();
    assert_eq!(stats.buried, 1);
    assert_eq!(stats.ready, 0);
  }

  #[tokio::test]
  async fn test_retry_buries_after_max_attempts() {
    let (_dir, manager) = manager().await;
    let record = crawl_record("c-3");
    let job_id = manager
      .enqueue(&record, None, JobPriority::Normal, Duration::ZERO, TTR)
      .await
      .unwrap();

    for attempt in 0..3 {
      let (_, record, lease) = manager
        .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
      manager
        .retry(&lease, &record, Duration::ZERO, None)
        .await
        .unwrap();
      let stats = manager.queue().stats_job(job_id).await.unwrap().unwrap();
      assert_eq!(stats.releases, attempt + 1);
    }

    let (_, record, lease) = manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    manager
      .retry(&lease, &record, Duration::ZERO, None)
      .await
      .unwrap();

    let stats = manager.queue().stats_job(job_id).await.unwrap().unwrap();
    assert_eq!(stats.releases, 3);
    assert_eq!(stats.buries, 1);
    assert!(manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_fail_reschedules_with_incremented_retries() {
    let (_dir, manager) = manager().await;
    let record = crawl_record("c-4");
    let job_id = manager
      .enqueue(&record, None, JobPriority::Normal, Duration::ZERO, TTR)
      .await
      .unwrap();

    let (_, record, lease) = manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    manager.fail(&lease, &record, false).await.unwrap();

    assert!(manager.queue().stats_job(job_id).await.unwrap().is_none());
    let stats = manager.queue().stats_tube(CRAWL_TUBE).await.unwrap();
    assert_eq!(stats.delayed, 1);

    let delayed = manager.queue().peek_delayed(CRAWL_TUBE).await.unwrap().unwrap();
    let rescheduled = JobCodec::new().decode(&delayed.body).unwrap();
    assert_eq!(rescheduled.retries, 1);
  }

  #[tokio::test]
  async fn test_fail_permanent_buries() {
    let (_dir, manager) = manager().await;
    let record = crawl_record("c-5");
    manager
      .enqueue(&record, None, JobPriority::Normal, Duration::ZERO, TTR)
      .await
      .unwrap();

    let (_, record, lease) = manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    manager.fail(&lease, &record, true).await.unwrap();

    let stats = manager.queue().stats_tube(CRAWL_TUBE).await.unwrap();
    assert_eq!(stats.buried, 1);
  }

  #[tokio::test]
  async fn test_complete_purges_ready_duplicates() {
    let (_dir, manager) = manager().await;
    let record = crawl_record("c-6");
    manager
      .enqueue(&record, None, JobPriority::Normal, Duration::ZERO, TTR)
      .await
      .unwrap();
    manager
      .enqueue(&record, None, JobPriority::Normal, Duration::ZERO, TTR)
      .await
      .unwrap();

    let (_, dequeued, lease) = manager
      .dequeue(&[CRAWL_TUBE.to_string()], Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    manager.complete(&lease, &dequeued).await.unwrap();

    let stats = manager.queue().stats_tube(CRAWL_TUBE).await.unwrap();
    assert_eq!(stats.total_jobs, 0);
  }
}
