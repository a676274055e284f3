use super::source_domain_repository::{SourceDomain, SourceDomainRepository};
use crate::crawler::crawl_job::{CrawlJobData, CrawlStatus};
use crate::crawler::crawl_job_repository::CrawlJobRepository;
use crate::queue::job_queue::JobPriority;
use crate::queue::queue_manager::{QueueManager, CRAWL_TUBE};
use crate::settings::Settings;
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};
use ulid::Ulid;

const STATS_LOG_EVERY_CYCLES: u64 = 10;
const MAX_ERROR_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
struct RunStatistics {
  total_cycles: u64,
  successful_cycles: u64,
  failed_cycles: u64,
  total_domains_submitted: u64,
}

/// Periodic admission of source domains into the crawl tube, bounded by a
/// capacity target computed from the tube backlog and the listener fleet
/// size. Safe to run in multiple instances; the conditional status
/// transition serializes admission per domain.
pub struct BulkAdmitter {
  settings: Arc<Settings>,
  queue_manager: Arc<QueueManager>,
  source_domains: Arc<SourceDomainRepository>,
  crawl_jobs: Arc<CrawlJobRepository>,
}

impl BulkAdmitter {
  pub fn new(
    settings: Arc<Settings>,
    queue_manager: Arc<QueueManager>,
    source_domains: Arc<SourceDomainRepository>,
    crawl_jobs: Arc<CrawlJobRepository>,
  ) -> Self {
    Self {
      settings,
      queue_manager,
      source_domains,
      crawl_jobs,
    }
  }

  fn job_data_for(&self, candidate: &SourceDomain) -> CrawlJobData {
    let crawler = &self.settings.crawler;
    let mut job_data = CrawlJobData {
      domain: Some(candidate.domain.clone()),
      url: candidate.url.clone(),
      max_pages: candidate.max_pages.unwrap_or(crawler.max_pages),
      single_url: candidate.single_url.unwrap_or(false),
      use_sitemap: candidate.use_sitemap.unwrap_or(crawler.use_sitemap),
      cycle_id: candidate.cycle_id.unwrap_or(0),
      project_id: candidate.project_id.clone(),
      custom_params: Default::default(),
    };
    // custom parameters never override the standard keys
    for (key, value) in &candidate.custom_params {
      match key.as_str() {
        "domain" | "url" | "max_pages" | "single_url" | "use_sitemap" | "cycle_id"
        | "project_id" => {
          warn!(
            domain = candidate.domain.as_str(),
            key = key.as_str(),
            "Custom parameter conflicts with standard parameter, ignoring"
          );
        }
        _ => {
          job_data.custom_params.insert(key.clone(), value.clone());
        }
      }
    }
    job_data.apply_url_defaults();
    job_data
  }

  async fn capacity_target(&self) -> Result<i64> {
    let ingest = &self.settings.ingest;
    let tube_stats = self.queue_manager.queue().stats_tube(CRAWL_TUBE).await?;
    let occupied = tube_stats.occupied() as i64;
    let mut target =
      (self.settings.crawler.instances as f64 * ingest.buffer_factor).floor() as i64 - occupied;
    if let Some(limit) = ingest.limit {
      target = target.min(limit as i64);
    }
    info!(
      ready = tube_stats.ready,
      reserved = tube_stats.reserved,
      target,
      "Computed admission capacity"
    );
    Ok(target)
  }

  async fn admit(&self, candidate: &SourceDomain) -> Result<()> {
    let ingest = &self.settings.ingest;
    let crawl_id = Ulid::new().to_string();
    let job_data = self.job_data_for(candidate);
    let record = job_data.to_record(&crawl_id);

    let job_id = match self
      .queue_manager
      .enqueue(
        &record,
        Some(CRAWL_TUBE),
        JobPriority::High,
        Duration::ZERO,
        Duration::from_secs(self.settings.queue.ttr_seconds as u64),
      )
      .await
    {
      Ok(job_id) => job_id,
      Err(e) => {
        self
          .source_domains
          .revert(
            &candidate.id,
            &ingest.pending_status,
            &candidate.status,
            &e.to_string(),
          )
          .await?;
        return Err(e);
      }
    };

    if let Err(e) = self
      .crawl_jobs
      .insert(&crawl_id, Some(job_id), &job_data, CrawlStatus::Fresh)
      .await
    {
      // the broker job exists but the state store record does not
      error!(
        orphan = true,
        job_id,
        crawl_id = crawl_id.as_str(),
        domain = candidate.domain.as_str(),
        error = e.to_string(),
        "CRITICAL: job enqueued but state store insert failed, manual intervention may be needed"
      );
      self
        .source_domains
        .revert(
          &candidate.id,
          &ingest.pending_status,
          &candidate.status,
          &e.to_string(),
        )
        .await?;
      return Err(e);
    }

    if let Err(e) = self
      .source_domains
      .mark_submitted(&candidate.id, &ingest.submitted_status, &crawl_id)
      .await
    {
      self
        .source_domains
        .revert(
          &candidate.id,
          &ingest.pending_status,
          &candidate.status,
          &e.to_string(),
        )
        .await?;
      return Err(e);
    }

    info!(
      domain = candidate.domain.as_str(),
      crawl_id = crawl_id.as_str(),
      job_id,
      "Admitted domain to crawler"
    );
    Ok(())
  }

  /// One admission cycle; returns the number of domains submitted.
  #[instrument(skip(self))]
  pub async fn run_cycle(&self) -> Result<u32> {
    let ingest = &self.settings.ingest;
    let target = self.capacity_target().await?;
    if target <= 0 {
      info!(target, "No new domains needed this cycle");
      return Ok(0);
    }

    let candidates = self
      .source_domains
      .find_by_status(&ingest.source_status, target as u32)
      .await?;
    if candidates.is_empty() {
      info!(status = ingest.source_status.as_str(), "No candidate domains found");
      return Ok(0);
    }

    let mut submitted = 0u32;
    for candidate in &candidates {
      if candidate.domain.trim().is_empty() {
        warn!(id = candidate.id.as_str(), "Skipping candidate with empty domain");
        continue;
      }
      let locked = self
        .source_domains
        .transition(&candidate.id, &ingest.source_status, &ingest.pending_status)
        .await?;
      if !locked {
        warn!(
          domain = candidate.domain.as_str(),
          "Failed to lock domain, another scheduler instance won"
        );
        continue;
      }

      match self.admit(candidate).await {
        Ok(()) => submitted += 1,
        Err(e) => {
          error!(
            domain = candidate.domain.as_str(),
            error = e.to_string(),
            "Failed to admit domain"
          );
        }
      }
    }

    info!(
      submitted,
      fetched = candidates.len(),
      "Finished admission cycle"
    );
    Ok(submitted)
  }

  async fn interruptible_sleep(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
      _ = shutdown.changed() => {}
      _ = sleep(duration) => {}
    }
  }

  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let interval = Duration::from_secs(self.settings.ingest.interval_seconds);
    info!(
      interval_seconds = interval.as_secs(),
      buffer_factor = self.settings.ingest.buffer_factor,
      "Bulk admitter started"
    );

    let mut statistics = RunStatistics::default();
    loop {
      if *shutdown.borrow() {
        break;
      }
      statistics.total_cycles += 1;

      match self.run_cycle().await {
        Ok(submitted) => {
          statistics.successful_cycles += 1;
          statistics.total_domains_submitted += submitted as u64;
          self.interruptible_sleep(interval, &mut shutdown).await;
        }
        Err(e) => {
          statistics.failed_cycles += 1;
          error!(error = e.to_string(), "Admission cycle failed");
          self
            .interruptible_sleep(interval.min(MAX_ERROR_SLEEP), &mut shutdown)
            .await;
        }
      }

      if statistics.total_cycles % STATS_LOG_EVERY_CYCLES == 0 {
        info!(
          total_cycles = statistics.total_cycles,
          successful_cycles = statistics.successful_cycles,
          failed_cycles = statistics.failed_cycles,
          total_domains_submitted = statistics.total_domains_submitted,
          "Admitter statistics"
        );
      }
    }

    info!(
      total_cycles = statistics.total_cycles,
      total_domains_submitted = statistics.total_domains_submitted,
      "Bulk admitter shut down"
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ingest::source_domain_repository::{
    STATUS_NEW, STATUS_PENDING_SUBMISSION, STATUS_SUBMITTED_TO_CRAWLER,
  };
  use crate::queue::job_codec::JobCodec;
  use crate::queue::job_queue::JobQueue;
  use crate::queue::sqlite_job_queue::SqliteJobQueue;
  use crate::settings::{CrawlerSettings, IngestSettings, QueueSettings, RateLimitSettings};
  use crate::sqlite::test_support;

  struct Fixture {
    _dir: tempfile::TempDir,
    admitter: BulkAdmitter,
    source_domains: Arc<SourceDomainRepository>,
    crawl_jobs: Arc<CrawlJobRepository>,
    queue: Arc<dyn JobQueue>,
  }

  fn test_settings(limit: Option<u32>) -> Settings {
    Settings {
      queue: QueueSettings {
        ttr_seconds: 300,
        max_attempts: 3,
      },
      crawler: CrawlerSettings {
        instances: 2,
        max_pages: 25,
        use_sitemap: false,
        request_timeout_seconds: 30,
        request_delay_ms: 0,
        user_agent: "trawler-test".to_string(),
        rate_limit: RateLimitSettings { max_requests: 600 },
        proxy: None,
      },
      ingest: IngestSettings {
        interval_seconds: 300,
        buffer_factor: 1.5,
        source_status: STATUS_NEW.to_string(),
        pending_status: STATUS_PENDING_SUBMISSION.to_string(),
        submitted_status: STATUS_SUBMITTED_TO_CRAWLER.to_string(),
        limit,
      },
      ..Default::default()
    }
  }

  async fn fixture(limit: Option<u32>) -> Fixture {
    let (dir, connection) = test_support::connection().await;
    let settings = Arc::new(test_settings(limit));
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(Arc::clone(&connection)));
    let queue_manager = Arc::new(QueueManager::new(
      Arc::clone(&queue),
      3,
      vec![CRAWL_TUBE.to_string()],
    ));
    let source_domains = Arc::new(SourceDomainRepository::new(Arc::clone(&connection)));
    let crawl_jobs = Arc::new(CrawlJobRepository::new(connection));
    Fixture {
      admitter: BulkAdmitter::new(
        settings,
        queue_manager,
        Arc::clone(&source_domains),
        Arc::clone(&crawl_jobs),
      ),
      source_domains,
      crawl_jobs,
      queue,
      _dir: dir,
    }
  }

  fn candidate(id: &str, domain: &str) -> SourceDomain {
    SourceDomain {
      id: id.to_string(),
      domain: domain.to_string(),
      status: STATUS_NEW.to_string(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_happy_path_single_url_submission() {
    let fixture = fixture(None).await;
    let mut record = candidate("d-1", "example.com");
    record.url = Some("https://example.com/a".to_string());
    record.max_pages = Some(25);
    fixture.source_domains.insert(&record).await.unwrap();

    // buffer_factor 1.5 * 2 instances, empty tube: room for 3
    let submitted = fixture.admitter.run_cycle().await.unwrap();
    assert_eq!(submitted, 1);

    let domain = fixture.source_domains.find("d-1").await.unwrap().unwrap();
    assert_eq!(domain.status, STATUS_SUBMITTED_TO_CRAWLER);
    let crawl_id = domain.crawl_id_ref.unwrap();

    let job = fixture.crawl_jobs.find(&crawl_id).await.unwrap().unwrap();
    assert_eq!(job.crawl_status, CrawlStatus::Fresh);
    // url submissions force the single-page shape
    assert!(job.job_data.single_url);
    assert_eq!(job.job_data.max_pages, 1);

    let peeked = fixture
      .queue
      .peek_ready(CRAWL_TUBE)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(peeked.priority, JobPriority::High.value());
    let body = JobCodec::new().decode(&peeked.body).unwrap();
    assert_eq!(body.crawl_id.as_deref(), Some(crawl_id.as_str()));
  }

  #[tokio::test]
  async fn test_capacity_target_limits_admission() {
    let fixture = fixture(None).await;
    for i in 0..5 {
      fixture
        .source_domains
        .insert(&candidate(&format!("d-{}", i), &format!("site{}.com", i)))
        .await
        .unwrap();
    }

    // floor(2 * 1.5) = 3 slots on an empty tube
    let submitted = fixture.admitter.run_cycle().await.unwrap();
    assert_eq!(submitted, 3);

    // the tube is now occupied, so the next cycle admits nothing
    let submitted = fixture.admitter.run_cycle().await.unwrap();
    assert_eq!(submitted, 0);

    let remaining = fixture
      .source_domains
      .find_by_status(STATUS_NEW, 10)
      .await
      .unwrap();
    assert_eq!(remaining.len(), 2);
  }

  #[tokio::test]
  async fn test_hard_limit_clamps_target() {
    let fixture = fixture(Some(1)).await;
    for i in 0..3 {
      fixture
        .source_domains
        .insert(&candidate(&format!("d-{}", i), &format!("site{}.com", i)))
        .await
        .unwrap();
    }

    assert_eq!(fixture.admitter.run_cycle().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_domain_locked_by_peer_is_left_alone() {
    let fixture = fixture(None).await;
    fixture
      .source_domains
      .insert(&candidate("d-1", "a.com"))
      .await
      .unwrap();
    fixture
      .source_domains
      .insert(&candidate("d-2", "b.com"))
      .await
      .unwrap();

    // another scheduler instance already locked d-1
    fixture
      .source_domains
      .transition("d-1", STATUS_NEW, STATUS_PENDING_SUBMISSION)
      .await
      .unwrap();

    let submitted = fixture.admitter.run_cycle().await.unwrap();
    assert_eq!(submitted, 1);

    let untouched = fixture.source_domains.find("d-1").await.unwrap().unwrap();
    assert_eq!(untouched.status, STATUS_PENDING_SUBMISSION);
    let admitted = fixture.source_domains.find("d-2").await.unwrap().unwrap();
    assert_eq!(admitted.status, STATUS_SUBMITTED_TO_CRAWLER);
  }

  #[tokio::test]
  async fn test_custom_params_cannot_shadow_standard_keys() {
    let fixture = fixture(None).await;
    let mut record = candidate("d-1", "a.com");
    record
      .custom_params
      .insert("max_pages".to_string(), serde_json::json!(9999));
    record
      .custom_params
      .insert("renderer_pool".to_string(), serde_json::json!("chromium"));
    record.max_pages = Some(7);
    fixture.source_domains.insert(&record).await.unwrap();

    fixture.admitter.run_cycle().await.unwrap();

    let domain = fixture.source_domains.find("d-1").await.unwrap().unwrap();
    let job = fixture
      .crawl_jobs
      .find(&domain.crawl_id_ref.unwrap())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(job.job_data.max_pages, 7);
    assert_eq!(
      job.job_data.custom_params.get("renderer_pool"),
      Some(&serde_json::json!("chromium"))
    );
    assert!(!job.job_data.custom_params.contains_key("max_pages"));
  }
}
