use super::crawl_engine::{CrawlContext, CrawlEngine};
use super::crawl_job::{CrawlJobData, CrawlStatus};
use super::crawl_job_repository::CrawlJobRepository;
use crate::files::content_store::ContentStore;
use crate::parser::parse_job_dispatcher::ParseJobDispatcher;
use crate::queue::job_queue::JobQueue;
use crate::queue::queue_manager::{JobLease, QueueManager, CRAWL_TUBE};
use crate::settings::Settings;
use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_secs(60);
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const TOUCH_INTERVAL_FACTOR: f64 = 0.4;
const MIN_TOUCH_INTERVAL_SECONDS: f64 = 15.0;
const KEEP_ALIVE_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Smallest TTR worth extending: touching a short lease buys nothing.
pub fn min_ttr_for_touching(default_ttr_seconds: u32) -> u32 {
  60.max(default_ttr_seconds / 5)
}

/// Touch cadence for a lease: a large fraction of the TTR, floored, and
/// clamped so a touch still lands at least 15 seconds before expiry.
pub fn touch_interval(ttr_seconds: u32) -> Duration {
  let ttr = ttr_seconds as f64;
  let mut interval = (ttr * TOUCH_INTERVAL_FACTOR).max(MIN_TOUCH_INTERVAL_SECONDS);
  if ttr - interval < MIN_TOUCH_INTERVAL_SECONDS {
    interval = (ttr - MIN_TOUCH_INTERVAL_SECONDS).max(MIN_TOUCH_INTERVAL_SECONDS);
  }
  Duration::from_secs_f64(interval)
}

/// Background task that keeps a leased job alive by touching it on an
/// interval. A touch that reports the job gone is logged and survived; a
/// transport failure ends the task. Cancellation is bounded by one interval
/// plus a small grace period.
pub struct TtrKeepAlive {
  stop_tx: watch::Sender<bool>,
  handle: tokio::task::JoinHandle<()>,
  join_bound: Duration,
}

impl TtrKeepAlive {
  pub fn start(queue: Arc<dyn JobQueue>, job_id: u64, ttr_seconds: u32) -> Self {
    let interval = touch_interval(ttr_seconds);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    info!(
      job_id,
      ttr_seconds,
      interval_seconds = interval.as_secs_f64(),
      "Starting TTR keep-alive"
    );

    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = stop_rx.changed() => break,
          _ = sleep(interval) => {
            match queue.touch(job_id).await {
              Ok(true) => debug!(job_id, "Touched job"),
              Ok(false) => warn!(job_id, "Touch found job gone, continuing"),
              Err(e) => {
                warn!(job_id, error = e.to_string(), "Touch failed, stopping keep-alive");
                break;
              }
            }
          }
        }
      }
      debug!(job_id, "TTR keep-alive stopped");
    });

    Self {
      stop_tx,
      handle,
      join_bound: interval + KEEP_ALIVE_JOIN_GRACE,
    }
  }

  pub async fn stop(self) {
    let _ = self.stop_tx.send(true);
    if timeout(self.join_bound, self.handle).await.is_err() {
      warn!("TTR keep-alive did not stop within its join bound");
    }
  }
}

/// Long-running consumer of the crawl tube: leases one job at a time, keeps
/// the lease alive while the engine runs, and finalizes the job against the
/// broker and the state store.
pub struct CrawlListener {
  instance_id: u32,
  settings: Arc<Settings>,
  queue_manager: Arc<QueueManager>,
  crawl_jobs: Arc<CrawlJobRepository>,
  content_store: Arc<ContentStore>,
  dispatcher: Arc<ParseJobDispatcher>,
  engine: Arc<dyn CrawlEngine>,
}

impl CrawlListener {
  pub fn new(
    instance_id: u32,
    settings: Arc<Settings>,
    queue_manager: Arc<QueueManager>,
    crawl_jobs: Arc<CrawlJobRepository>,
    content_store: Arc<ContentStore>,
    dispatcher: Arc<ParseJobDispatcher>,
    engine: Arc<dyn CrawlEngine>,
  ) -> Self {
    Self {
      instance_id,
      settings,
      queue_manager,
      crawl_jobs,
      content_store,
      dispatcher,
      engine,
    }
  }

  async fn resolve_job_data(
    &self,
    crawl_id: &str,
    record: &crate::queue::job_codec::JobRecord,
  ) -> Result<CrawlJobData> {
    if record.is_lookup_only() {
      let job = self
        .crawl_jobs
        .find(crawl_id)
        .await?
        .ok_or_else(|| anyhow!("Lookup-only submission for unknown crawl_id {}", crawl_id))?;
      Ok(job.job_data)
    } else {
      CrawlJobData::from_record(record, &self.settings.crawler)
    }
  }

  async fn retry_or_bury(&self, lease: &JobLease, record: &crate::queue::job_codec::JobRecord) {
    if let Err(e) = self
      .queue_manager
      .retry(lease, record, RETRY_DELAY, None)
      .await
    {
      error!(
        job_id = lease.job_id,
        error = e.to_string(),
        "Failed to retry or bury job"
      );
    }
  }

  /// Handles at most one leased job. Returns false on reserve timeout.
  #[instrument(skip(self), fields(instance_id = self.instance_id))]
  pub async fn execute(&self) -> Result<bool> {
    let Some((job_id, mut record, lease)) = self
      .queue_manager
      .dequeue(&[CRAWL_TUBE.to_string()], RESERVE_TIMEOUT)
      .await?
    else {
      return Ok(false);
    };

    if record.crawl_id.as_deref().unwrap_or("").is_empty() {
      let generated = Ulid::new().to_string();
      warn!(job_id, crawl_id = generated.as_str(), "Job was missing crawl_id, generated one");
      record.crawl_id = Some(generated);
    }
    let crawl_id = record.crawl_id.clone().unwrap();
    info!(job_id, crawl_id = crawl_id.as_str(), "Reserved crawl job");

    let default_ttr = self.settings.queue.ttr_seconds;
    let job_ttr = self
      .queue_manager
      .queue()
      .stats_job(job_id)
      .await
      .ok()
      .flatten()
      .map(|stats| stats.ttr_seconds)
      .unwrap_or(default_ttr);

    let keep_alive = if job_ttr >= min_ttr_for_touching(default_ttr) {
      Some(TtrKeepAlive::start(
        Arc::clone(self.queue_manager.queue()),
        job_id,
        job_ttr,
      ))
    } else {
      debug!(job_id, job_ttr, "TTR too short, not starting keep-alive");
      None
    };

    let outcome: Result<()> = async {
      self.crawl_jobs.set_crawling(&crawl_id, job_id).await?;
      let job_data = self.resolve_job_data(&crawl_id, &record).await?;

      let ctx = CrawlContext {
        crawl_id: crawl_id.clone(),
        content_store: Arc::clone(&self.content_store),
        dispatcher: Arc::clone(&self.dispatcher),
        crawl_jobs: Arc::clone(&self.crawl_jobs),
      };

      match self.engine.run(&job_data, &ctx).await {
        Ok(outcome) if outcome.stats.pages_crawled > 0 => {
          self.queue_manager.complete(&lease, &record).await?;
          let duration = outcome.stats.duration_seconds.unwrap_or(0.0);
          self
            .crawl_jobs
            .record_completion(
              &crawl_id,
              &outcome.stats,
              &format!("Crawler completed successfully in {:.2} seconds", duration),
            )
            .await?;
          info!(job_id, crawl_id = crawl_id.as_str(), "Crawl job completed");
        }
        Ok(outcome) => {
          warn!(job_id, crawl_id = crawl_id.as_str(), "Engine exited clean with zero pages");
          let mut stats = outcome.stats;
          stats
            .crawl_errors
            .push("engine exited successfully but captured zero pages".to_string());
          self.retry_or_bury(&lease, &record).await;
          self
            .crawl_jobs
            .mark_failed(
              &crawl_id,
              CrawlStatus::Failed,
              "engine captured zero pages",
              Some(&stats),
            )
            .await?;
        }
        Err(engine_error) => {
          warn!(
            job_id,
            crawl_id = crawl_id.as_str(),
            error = engine_error.to_string(),
            "Engine failed"
          );
          self.retry_or_bury(&lease, &record).await;
          self
            .crawl_jobs
            .mark_failed(
              &crawl_id,
              CrawlStatus::Failed,
              &engine_error.to_string(),
              None,
            )
            .await?;
        }
      }
      Ok(())
    }
    .await;

    if let Err(processing_error) = outcome {
      error!(
        job_id,
        crawl_id = crawl_id.as_str(),
        error = processing_error.to_string(),
        "Exception during job processing"
      );
      if let Err(e) = self
        .crawl_jobs
        .mark_failed(
          &crawl_id,
          CrawlStatus::FailedException,
          &processing_error.to_string(),
          None,
        )
        .await
      {
        error!(
          crawl_id = crawl_id.as_str(),
          error = e.to_string(),
          "Additionally failed to record failed_exception status"
        );
      }
      self.retry_or_bury(&lease, &record).await;
    }

    if let Some(keep_alive) = keep_alive {
      keep_alive.stop().await;
    }
    Ok(true)
  }

  /// Reserve/process loop. Shutdown is observed between jobs so an
  /// in-flight job is always finalized before the loop exits.
  pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(instance_id = self.instance_id, "Crawl listener started");
    while !*shutdown.borrow() {
      if let Err(e) = self.execute().await {
        error!(
          instance_id = self.instance_id,
          error = e.to_string(),
          "Error in crawl listener loop"
        );
        sleep(LOOP_ERROR_BACKOFF).await;
      }
    }
    info!(instance_id = self.instance_id, "Crawl listener shut down");
    Ok(())
  }
}
