use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
  #[error("Queue connection error: {0}")]
  Connection(String),

  #[error("Queue database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("Job not found: {0}")]
  NotFound(u64),
}

/// Symbolic priorities; lower numeric value is delivered sooner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobPriority {
  High,
  #[default]
  Normal,
  Low,
}

impl JobPriority {
  pub fn value(&self) -> u32 {
    match self {
      JobPriority::High => 0,
      JobPriority::Normal => 100,
      JobPriority::Low => 1000,
    }
  }
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
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Ready,
  Delayed,
  Reserved,
  Buried,
}

#[derive(Debug, Clone)]
pub struct ReservedJob {
  pub id: u64,
  pub tube: String,
  pub body: Vec<u8>,
  pub ttr_seconds: u32,
  pub reserves: u32,
  pub releases: u32,
}

#[derive(Debug, Clone)]
pub struct PeekedJob {
  pub id: u64,
  pub body: Vec<u8>,
  pub priority: u32,
  pub state: JobState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TubeStats {
  pub ready: u32,
  pub delayed: u32,
  pub reserved: u32,
  pub buried: u32,
  pub total_jobs: u32,
}

impl TubeStats {
  pub fn occupied(&self) -> u32 {
    self.ready + self.reserved
  }
}

#[derive(Debug, Clone)]
pub struct JobStats {
  pub id: u64,
  pub tube: String,
  pub state: JobState,
  pub priority: u32,
  pub ttr_seconds: u32,
  pub age_seconds: i64,
  pub reserves: u32,
  pub releases: u32,
  pub buries: u32,
  pub timeouts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
  pub tubes: HashMap<String, TubeStats>,
}

impl QueueStats {
  pub fn total_ready(&self) -> u32 {
    self.tubes.values().map(|t| t.ready).sum()
  }

  pub fn total_reserved(&self) -> u32 {
    self.tubes.values().map(|t| t.reserved).sum()
  }

  pub fn total_buried(&self) -> u32 {
    self.tubes.values().map(|t| t.buried).sum()
  }
}

/// A FIFO priority work queue with named tubes and beanstalk-style job
/// lifecycle: `reserve -> {delete | release | bury | touch}`. A reservation
/// left past its TTR is returned to the ready state automatically.
#[async_trait]
pub trait JobQueue: Send + Sync {
  async fn put(
    &self,
    tube: &str,
    body: &[u8],
    priority: u32,
    delay: Duration,
    ttr: Duration,
  ) -> Result<u64, QueueError>;

  /// Blocks up to `timeout` for the next leasable job from `tubes`.
  /// A timeout is not an error; it returns `None`.
  async fn reserve(
    &self,
    tubes: &[String],
    timeout: Duration,
  ) -> Result<Option<ReservedJob>, QueueError>;

  /// Resets a leased job's remaining TTR to its full value. Returns false
  /// when the job no longer exists or is no longer reserved.
  async fn touch(&self, job_id: u64) -> Result<bool, QueueError>;

  async fn delete(&self, job_id: u64) -> Result<(), QueueError>;

  async fn release(&self, job_id: u64, priority: u32, delay: Duration) -> Result<(), QueueError>;

  async fn bury(&self, job_id: u64, priority: u32) -> Result<(), QueueError>;

  /// Returns up to `bound` buried jobs of the tube to the ready state.
  async fn kick(&self, tube: &str, bound: u32) -> Result<u32, QueueError>;

  async fn peek_ready(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError>;

  async fn peek_delayed(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError>;

  async fn peek_buried(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError>;

  async fn stats_tube(&self, tube: &str) -> Result<TubeStats, QueueError>;

  async fn stats_job(&self, job_id: u64) -> Result<Option<JobStats>, QueueError>;

  async fn stats(&self) -> Result<QueueStats, QueueError>;
}
