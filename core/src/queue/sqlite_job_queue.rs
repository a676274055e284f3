use super::job_queue::{
  JobQueue, JobState, JobStats, PeekedJob, QueueError, QueueStats, ReservedJob, TubeStats,
};
use crate::sqlite::SqliteConnection;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use deadpool_sqlite::Object;
use rusqlite::{params, types::Value, OptionalExtension};
use std::{collections::HashMap, rc::Rc, str::FromStr, sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

const RESERVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Embedded broker over the shared sqlite database. One row per job; a
/// reservation is a conditional state flip guarded by `reserved_at`, and a
/// reservation older than its TTR is swept back to ready on the next
/// reserve pass with `timeouts` incremented.
#[derive(Debug)]
pub struct SqliteJobQueue {
  sqlite_connection: Arc<SqliteConnection>,
}

fn now() -> NaiveDateTime {
  chrono::Utc::now().naive_utc()
}

impl SqliteJobQueue {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  async fn read(&self) -> Result<Object, QueueError> {
    self
      .sqlite_connection
      .read()
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))
  }

  async fn write(&self) -> Result<Object, QueueError> {
    self
      .sqlite_connection
      .write()
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))
  }

  #[instrument(skip(self))]
  async fn try_reserve(&self, tubes: Vec<String>) -> Result<Option<ReservedJob>, QueueError> {
    self
      .write()
      .await?
      .interact(move |conn| {
        let reserve_time = now();
        let swept = conn.execute(
          "
          UPDATE queue_jobs
          SET state = 'ready', reserved_at = NULL, timeouts = timeouts + 1
          WHERE state = 'reserved'
            AND strftime('%s', reserved_at) + ttr_seconds <= strftime('%s', ?1)
          ",
          params![reserve_time],
        )?;
        if swept > 0 {
          warn!(count = swept, "Returned expired reservations to ready");
        }

        let tube_values = Rc::new(tubes.into_iter().map(Value::from).collect::<Vec<Value>>());
        let candidate = conn
          .query_row(
            "
            SELECT id, tube, body, ttr_seconds, reserves, releases
            FROM queue_jobs
            WHERE tube IN rarray(?1) AND state = 'ready' AND ready_at <= ?2
            ORDER BY priority, id
            LIMIT 1
            ",
            params![tube_values, reserve_time],
            |row| {
              Ok(ReservedJob {
                id: row.get::<_, i64>(0)? as u64,
                tube: row.get(1)?,
                body: row.get(2)?,
                ttr_seconds: row.get(3)?,
                reserves: row.get(4)?,
                releases: row.get(5)?,
              })
            },
          )
          .optional()?;

        let Some(mut job) = candidate else {
          return Ok(None);
        };

        let claimed = conn.execute(
          "
          UPDATE queue_jobs
          SET state = 'reserved', reserved_at = ?1, reserves = reserves + 1
          WHERE id = ?2 AND state = 'ready'
          ",
          params![reserve_time, job.id as i64],
        )?;
        if claimed == 0 {
          return Ok(None);
        }
        job.reserves += 1;
        debug!(job_id = job.id, tube = job.tube.as_str(), "Reserved job");
        Ok(Some(job))
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?
  }

  async fn peek_where(&self, tube: &str, predicate: &'static str) -> Result<Option<PeekedJob>, QueueError> {
    let tube = tube.to_string();
    self
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            &format!(
              "
              SELECT id, body, priority, state, ready_at
              FROM queue_jobs
              WHERE tube = ?1 AND {}
              ORDER BY priority, id
              LIMIT 1
              ",
              predicate
            ),
            params![tube, now()],
            |row| {
              let state = JobState::from_str(row.get::<_, String>(3)?.as_str())
                .unwrap_or(JobState::Ready);
              let ready_at = row.get::<_, NaiveDateTime>(4)?;
              let state = if state == JobState::Ready && ready_at > now() {
                JobState::Delayed
              } else {
                state
              };
              Ok(PeekedJob {
                id: row.get::<_, i64>(0)? as u64,
                body: row.get(1)?,
                priority: row.get(2)?,
                state,
              })
            },
          )
          .optional()
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?
      .map_err(QueueError::from)
  }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
  #[instrument(skip(self, body))]
  async fn put(
    &self,
    tube: &str,
    body: &[u8],
    priority: u32,
    delay: Duration,
    ttr: Duration,
  ) -> Result<u64, QueueError> {
    let tube = tube.to_string();
    let body = body.to_vec();
    let job_id = self
      .write()
      .await?
      .interact(move |conn| {
        let created_at = now();
        let ready_at =
          created_at + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        conn.execute(
          "
          INSERT INTO queue_jobs (tube, body, priority, state, ready_at, ttr_seconds, created_at)
          VALUES (?1, ?2, ?3, 'ready', ?4, ?5, ?6)
          ",
          params![
            tube,
            body,
            priority,
            ready_at,
            ttr.as_secs() as u32,
            created_at
          ],
        )?;
        Ok::<_, rusqlite::Error>(conn.last_insert_rowid() as u64)
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))??;
    debug!(job_id, "Enqueued job");
    Ok(job_id)
  }

  async fn reserve(
    &self,
    tubes: &[String],
    timeout: Duration,
  ) -> Result<Option<ReservedJob>, QueueError> {
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(job) = self.try_reserve(tubes.to_vec()).await? {
        return Ok(Some(job));
      }
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Ok(None);
      }
      sleep(remaining.min(RESERVE_POLL_INTERVAL)).await;
    }
  }

  #[instrument(skip(self))]
  async fn touch(&self, job_id: u64) -> Result<bool, QueueError> {
    let touched = self
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "UPDATE queue_jobs SET reserved_at = ?1 WHERE id = ?2 AND state = 'reserved'",
          params![now(), job_id as i64],
        )
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))??;
    Ok(touched > 0)
  }

  #[instrument(skip(self))]
  async fn delete(&self, job_id: u64) -> Result<(), QueueError> {
    let deleted = self
      .write()
      .await?
      .interact(move |conn| {
        conn.execute("DELETE FROM queue_jobs WHERE id = ?1", params![job_id as i64])
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))??;
    if deleted == 0 {
      return Err(QueueError::NotFound(job_id));
    }
    Ok(())
  }

  #[instrument(skip(self))]
  async fn release(&self, job_id: u64, priority: u32, delay: Duration) -> Result<(), QueueError> {
    let released = self
      .write()
      .await?
      .interact(move |conn| {
        let ready_at =
          now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        conn.execute(
          "
          UPDATE queue_jobs
          SET state = 'ready', ready_at = ?1, priority = ?2, reserved_at = NULL,
              releases = releases + 1
          WHERE id = ?3
          ",
          params![ready_at, priority, job_id as i64],
        )
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))??;
    if released == 0 {
      return Err(QueueError::NotFound(job_id));
    }
    Ok(())
  }

  #[instrument(skip(self))]
  async fn bury(&self, job_id: u64, priority: u32) -> Result<(), QueueError> {
    let buried = self
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "
          UPDATE queue_jobs
          SET state = 'buried', priority = ?1, reserved_at = NULL, buries = buries + 1
          WHERE id = ?2
          ",
          params![priority, job_id as i64],
        )
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))??;
    if buried == 0 {
      return Err(QueueError::NotFound(job_id));
    }
    Ok(())
  }

  #[instrument(skip(self))]
  async fn kick(&self, tube: &str, bound: u32) -> Result<u32, QueueError> {
    let tube = tube.to_string();
    let kicked = self
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "
          UPDATE queue_jobs
          SET state = 'ready', ready_at = ?1
          WHERE id IN (
            SELECT id FROM queue_jobs
            WHERE tube = ?2 AND state = 'buried'
            ORDER BY priority, id
            LIMIT ?3
          )
          ",
          params![now(), tube, bound],
        )
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))??;
    Ok(kicked as u32)
  }

  async fn peek_ready(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError> {
    self
      .peek_where(tube, "state = 'ready' AND ready_at <= ?2")
      .await
  }

  async fn peek_delayed(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError> {
    self
      .peek_where(tube, "state = 'ready' AND ready_at > ?2")
      .await
  }

  async fn peek_buried(&self, tube: &str) -> Result<Option<PeekedJob>, QueueError> {
    self
      .peek_where(tube, "state = 'buried' AND ?2 IS NOT NULL")
      .await
  }

  #[instrument(skip(self))]
  async fn stats_tube(&self, tube: &str) -> Result<TubeStats, QueueError> {
    let tube = tube.to_string();
    self
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "
          SELECT
            COALESCE(SUM(CASE WHEN state = 'ready' AND ready_at <= ?2 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'ready' AND ready_at > ?2 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'reserved' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'buried' THEN 1 ELSE 0 END), 0),
            COUNT(*)
          FROM queue_jobs
          WHERE tube = ?1
          ",
          params![tube, now()],
          |row| {
            Ok(TubeStats {
              ready: row.get(0)?,
              delayed: row.get(1)?,
              reserved: row.get(2)?,
              buried: row.get(3)?,
              total_jobs: row.get(4)?,
            })
          },
        )
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?
      .map_err(QueueError::from)
  }

  #[instrument(skip(self))]
  async fn stats_job(&self, job_id: u64) -> Result<Option<JobStats>, QueueError> {
    self
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            "
            SELECT id, tube, state, ready_at, priority, ttr_seconds, created_at,
                   reserves, releases, buries, timeouts
            FROM queue_jobs
            WHERE id = ?1
            ",
            params![job_id as i64],
            |row| {
              let state = JobState::from_str(row.get::<_, String>(2)?.as_str())
                .unwrap_or(JobState::Ready);
              let ready_at = row.get::<_, NaiveDateTime>(3)?;
              let state = if state == JobState::Ready && ready_at > now() {
                JobState::Delayed
              } else {
                state
              };
              let created_at = row.get::<_, NaiveDateTime>(6)?;
              Ok(JobStats {
                id: row.get::<_, i64>(0)? as u64,
                tube: row.get(1)?,
                state,
                priority: row.get(4)?,
                ttr_seconds: row.get(5)?,
                age_seconds: (now() - created_at).num_seconds(),
                reserves: row.get(7)?,
                releases: row.get(8)?,
                buries: row.get(9)?,
                timeouts: row.get(10)?,
              })
            },
          )
          .optional()
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?
      .map_err(QueueError::from)
  }

  #[instrument(skip(self))]
  async fn stats(&self) -> Result<QueueStats, QueueError> {
    self
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          SELECT
            tube,
            COALESCE(SUM(CASE WHEN state = 'ready' AND ready_at <= ?1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'ready' AND ready_at > ?1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'reserved' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 'buried' THEN 1 ELSE 0 END), 0),
            COUNT(*)
          FROM queue_jobs
          GROUP BY tube
          ",
        )?;
        let tubes = statement
          .query_map(params![now()], |row| {
            Ok((
              row.get::<_, String>(0)?,
              TubeStats {
                ready: row.get(1)?,
                delayed: row.get(2)?,
                reserved: row.get(3)?,
                buried: row.get(4)?,
                total_jobs: row.get(5)?,
              },
            ))
          })?
          .collect::<Result<HashMap<_, _>, _>>()?;
        Ok::<_, rusqlite::Error>(QueueStats { tubes })
      })
      .await
      .map_err(|e| QueueError::Connection(e.to_string()))?
      .map_err(QueueError::from)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sqlite::test_support;

  const TTR: Duration = Duration::from_secs(60);
  const NO_DELAY: Duration = Duration::ZERO;

  async fn queue() -> (tempfile::TempDir, SqliteJobQueue) {
    let (dir, connection) = test_support::connection().await;
    (dir, SqliteJobQueue::new(connection))
  }

  fn tubes(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
  }

  #[tokio::test]
  async fn test_reserve_timeout_returns_none() {
    let (_dir, queue) = queue().await;
    let job = queue
      .reserve(&tubes(&["empty"]), Duration::from_millis(50))
      .await
      .unwrap();
    assert!(job.is_none());
  }

  #[tokio::test]
  async fn test_priority_then_fifo_order() {
    let (_dir, queue) = queue().await;
    let low = queue.put("t", b"low", 1000, NO_DELAY, TTR).await.unwrap();
    let first = queue.put("t", b"first", 100, NO_DELAY, TTR).await.unwrap();
    let second = queue.put("t", b"second", 100, NO_DELAY, TTR).await.unwrap();
    let high = queue.put("t", b"high", 0, NO_DELAY, TTR).await.unwrap();

    let order = [high, first, second, low];
    for expected in order {
      let job = queue
        .reserve(&tubes(&["t"]), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
      assert_eq!(job.id, expected);
      queue.delete(job.id).await.unwrap();
    }
  }

  #[tokio::test]
  async fn test_delayed_job_not_reservable_until_ready() {
    let (_dir, queue) = queue().await;
    let job_id = queue
      .put("t", b"later", 100, Duration::from_secs(60), TTR)
      .await
      .unwrap();

    assert!(queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .is_none());
    let peeked = queue.peek_delayed("t").await.unwrap().unwrap();
    assert_eq!(peeked.id, job_id);
    assert_eq!(peeked.state, JobState::Delayed);
  }

  #[tokio::test]
  async fn test_expired_reservation_is_swept_back_to_ready() {
    let (_dir, queue) = queue().await;
    let job_id = queue
      .put("t", b"x", 100, NO_DELAY, Duration::from_secs(1))
      .await
      .unwrap();

    let first = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(first.id, job_id);

    sleep(Duration::from_secs(3)).await;

    let again = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(again.id, job_id);
    assert_eq!(again.reserves, 2);

    let stats = queue.stats_job(job_id).await.unwrap().unwrap();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.releases, 0);
  }

  #[tokio::test]
  async fn test_touch_is_non_fatal_on_missing_job() {
    let (_dir, queue) = queue().await;
    let job_id = queue.put("t", b"x", 100, NO_DELAY, TTR).await.unwrap();
    let job = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();

    assert!(queue.touch(job.id).await.unwrap());
    queue.delete(job_id).await.unwrap();
    assert!(!queue.touch(job_id).await.unwrap());
  }

  #[tokio::test]
  async fn test_release_increments_counter_and_requeues() {
    let (_dir, queue) = queue().await;
    let job_id = queue.put("t", b"x", 100, NO_DELAY, TTR).await.unwrap();
    let job = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();

    queue.release(job.id, 0, NO_DELAY).await.unwrap();
    let stats = queue.stats_job(job_id).await.unwrap().unwrap();
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.state, JobState::Ready);
    assert_eq!(stats.priority, 0);
  }

  #[tokio::test]
  async fn test_bury_and_kick() {
    let (_dir, queue) = queue().await;
    let job_id = queue.put("t", b"x", 100, NO_DELAY, TTR).await.unwrap();
    let job = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();

    queue.bury(job.id, 100).await.unwrap();
    assert!(queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .is_none());
    let buried = queue.peek_buried("t").await.unwrap().unwrap();
    assert_eq!(buried.id, job_id);

    assert_eq!(queue.kick("t", 10).await.unwrap(), 1);
    let kicked = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(kicked.id, job_id);
  }

  #[tokio::test]
  async fn test_stats_tube_counts() {
    let (_dir, queue) = queue().await;
    queue.put("t", b"a", 100, NO_DELAY, TTR).await.unwrap();
    queue.put("t", b"b", 100, NO_DELAY, TTR).await.unwrap();
    queue
      .put("t", b"c", 100, Duration::from_secs(60), TTR)
      .await
      .unwrap();
    let reserved = queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();
    queue.bury(reserved.id, 100).await.unwrap();
    queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .unwrap();

    let stats = queue.stats_tube("t").await.unwrap();
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.reserved, 1);
    assert_eq!(stats.buried, 1);
    assert_eq!(stats.total_jobs, 3);
    assert_eq!(stats.occupied(), 1);
  }

  #[tokio::test]
  async fn test_reserve_only_watches_given_tubes() {
    let (_dir, queue) = queue().await;
    queue.put("other", b"x", 100, NO_DELAY, TTR).await.unwrap();
    assert!(queue
      .reserve(&tubes(&["t"]), Duration::ZERO)
      .await
      .unwrap()
      .is_none());
  }
}
