use crate::crawler::crawl_job_repository::CrawlJobRepository;
use crate::queue::job_queue::{JobQueue, QueueStats};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::sync::Arc;
use sysinfo::{Disks, System};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

const CPU_WARNING_THRESHOLD: f32 = 80.0;
const MEMORY_WARNING_THRESHOLD: f32 = 80.0;
const DISK_WARNING_THRESHOLD: f32 = 80.0;

#[derive(Debug, Clone)]
pub struct HealthReport {
  pub queue_ok: bool,
  pub database_ok: bool,
  pub total_ready: u32,
  pub total_reserved: u32,
  pub total_buried: u32,
  pub cpu_percent: f32,
  pub memory_percent: f32,
  pub disk_percent: f32,
  pub warnings: Vec<String>,
  pub checked_at: NaiveDateTime,
}

impl HealthReport {
  pub fn is_healthy(&self) -> bool {
    self.queue_ok && self.database_ok
  }
}

/// Periodic probes of the broker, the database, and local system
/// resources. Resource pressure produces warnings only; broker or database
/// failure is what marks the system unhealthy.
pub struct HealthMonitor {
  queue: Arc<dyn JobQueue>,
  crawl_jobs: Arc<CrawlJobRepository>,
  system: Mutex<System>,
}

impl HealthMonitor {
  pub fn new(queue: Arc<dyn JobQueue>, crawl_jobs: Arc<CrawlJobRepository>) -> Self {
    Self {
      queue,
      crawl_jobs,
      system: Mutex::new(System::new()),
    }
  }

  pub async fn probe_queue(&self) -> Result<QueueStats> {
    self.queue.stats().await.context("Broker stats probe failed")
  }

  pub async fn probe_database(&self) -> Result<()> {
    self.crawl_jobs.ping().await.context("Database ping failed")
  }

  async fn system_usage(&self) -> (f32, f32, f32) {
    let mut system = self.system.lock().await;
    system.refresh_cpu_usage();
    system.refresh_memory();
    let cpu_percent = system.global_cpu_usage();
    let memory_percent = if system.total_memory() > 0 {
      (system.used_memory() as f32 / system.total_memory() as f32) * 100.0
    } else {
      0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (total, available) = disks.iter().fold((0u64, 0u64), |(total, available), disk| {
      (total + disk.total_space(), available + disk.available_space())
    });
    let disk_percent = if total > 0 {
      ((total - available) as f32 / total as f32) * 100.0
    } else {
      0.0
    };

    (cpu_percent, memory_percent, disk_percent)
  }

  #[instrument(skip(self))]
  pub async fn report(&self) -> HealthReport {
    let mut warnings = Vec::new();

    let queue_stats = match self.probe_queue().await {
      Ok(stats) => Some(stats),
      Err(e) => {
        warnings.push(format!("broker: {}", e));
        None
      }
    };
    let database_ok = match self.probe_database().await {
      Ok(()) => true,
      Err(e) => {
        warnings.push(format!("database: {}", e));
        false
      }
    };

    let (cpu_percent, memory_percent, disk_percent) = self.system_usage().await;
    if cpu_percent > CPU_WARNING_THRESHOLD {
      warnings.push(format!("cpu usage at {:.1}%", cpu_percent));
    }
    if memory_percent > MEMORY_WARNING_THRESHOLD {
      warnings.push(format!("memory usage at {:.1}%", memory_percent));
    }
    if disk_percent > DISK_WARNING_THRESHOLD {
      warnings.push(format!("disk usage at {:.1}%", disk_percent));
    }

    for warning in &warnings {
      warn!(warning = warning.as_str(), "Health warning");
    }

    HealthReport {
      queue_ok: queue_stats.is_some(),
      database_ok,
      total_ready: queue_stats.as_ref().map(|s| s.total_ready()).unwrap_or(0),
      total_reserved: queue_stats.as_ref().map(|s| s.total_reserved()).unwrap_or(0),
      total_buried: queue_stats.as_ref().map(|s| s.total_buried()).unwrap_or(0),
      cpu_percent,
      memory_percent,
      disk_percent,
      warnings,
      checked_at: chrono::Utc::now().naive_utc(),
    }
  }
}
