use super::crawl_job::{CrawlJob, CrawlJobData, CrawlStats, CrawlStatus};
use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};
use std::{str::FromStr, sync::Arc};
use tracing::{error, instrument};

#[derive(Clone, Debug)]
pub struct CrawlJobRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

fn now() -> NaiveDateTime {
  chrono::Utc::now().naive_utc()
}

fn row_to_crawl_job(row: &Row) -> rusqlite::Result<CrawlJob> {
  let job_data: String = row.get(2)?;
  let status: String = row.get(3)?;
  let stats: Option<String> = row.get(6)?;
  Ok(CrawlJob {
    crawl_id: row.get(0)?,
    job_id: row.get::<_, Option<i64>>(1)?.map(|id| id as u64),
    job_data: serde_json::from_str(&job_data).unwrap_or_default(),
    crawl_status: CrawlStatus::from_str(&status).unwrap_or(CrawlStatus::Fresh),
    status_message: row.get(4)?,
    error_message: row.get(5)?,
    crawl_stats: stats.and_then(|s| serde_json::from_str(&s).ok()),
    created_at: row.get(7)?,
    updated_at: row.get(8)?,
  })
}

const SELECT_COLUMNS: &str = "
  crawl_id, job_id, job_data, crawl_status, status_message, error_message,
  crawl_stats, created_at, updated_at
";

impl CrawlJobRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip(self, job_data))]
  pub async fn insert(
    &self,
    crawl_id: &str,
    job_id: Option<u64>,
    job_data: &CrawlJobData,
    status: CrawlStatus,
  ) -> Result<()> {
    let crawl_id = crawl_id.to_string();
    let job_data = serde_json::to_string(job_data)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let timestamp = now();
        let mut statement = conn.prepare(
          "
          INSERT INTO crawl_jobs (crawl_id, job_id, job_data, crawl_status, created_at, updated_at)
          VALUES (?1, ?2, ?3, ?4, ?5, ?5)
          ",
        )?;
        statement.execute(params![
          crawl_id,
          job_id.map(|id| id as i64),
          job_data,
          status.to_string(),
          timestamp,
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to insert crawl job");
        anyhow!("Failed to insert crawl job")
      })?
  }

  /// Marks the job as crawling with the current broker job id, creating the
  /// record if submission never reached the state store.
  #[instrument(skip(self))]
  pub async fn set_crawling(&self, crawl_id: &str, job_id: u64) -> Result<()> {
    let crawl_id = crawl_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let timestamp = now();
        let mut statement = conn.prepare(
          "
          INSERT INTO crawl_jobs (crawl_id, job_id, job_data, crawl_status, created_at, updated_at)
          VALUES (?1, ?2, '{}', ?3, ?4, ?4)
          ON CONFLICT (crawl_id) DO UPDATE SET
            job_id = excluded.job_id,
            crawl_status = excluded.crawl_status,
            updated_at = excluded.updated_at
          ",
        )?;
        statement.execute(params![
          crawl_id,
          job_id as i64,
          CrawlStatus::Crawling.to_string(),
          timestamp,
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to mark crawl job crawling");
        anyhow!("Failed to mark crawl job crawling")
      })?
  }

  #[instrument(skip(self))]
  pub async fn set_status(
    &self,
    crawl_id: &str,
    status: CrawlStatus,
    message: Option<&str>,
  ) -> Result<bool> {
    let crawl_id = crawl_id.to_string();
    let message = message.map(|m| m.to_string());
    let updated = self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE crawl_jobs
          SET crawl_status = ?1,
              status_message = COALESCE(?2, status_message),
              updated_at = ?3
          WHERE crawl_id = ?4
          ",
        )?;
        statement.execute(params![status.to_string(), message, now(), crawl_id])
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to update crawl job status");
        anyhow!("Failed to update crawl job status")
      })??;
    Ok(updated > 0)
  }

  #[instrument(skip(self, stats))]
  pub async fn mark_failed(
    &self,
    crawl_id: &str,
    status: CrawlStatus,
    error_message: &str,
    stats: Option<&CrawlStats>,
  ) -> Result<()> {
    let crawl_id = crawl_id.to_string();
    let error_message = error_message.to_string();
    let stats = stats.map(serde_json::to_string).transpose()?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE crawl_jobs
          SET crawl_status = ?1,
              error_message = ?2,
              crawl_stats = COALESCE(?3, crawl_stats),
              updated_at = ?4
          WHERE crawl_id = ?5
          ",
        )?;
        statement.execute(params![
          status.to_string(),
          error_message,
          stats,
          now(),
          crawl_id
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to mark crawl job failed");
        anyhow!("Failed to mark crawl job failed")
      })?
  }

  #[instrument(skip(self, stats))]
  pub async fn record_completion(
    &self,
    crawl_id: &str,
    stats: &CrawlStats,
    status_message: &str,
  ) -> Result<()> {
    let crawl_id = crawl_id.to_string();
    let status_message = status_message.to_string();
    let stats = serde_json::to_string(stats)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE crawl_jobs
          SET crawl_status = ?1, status_message = ?2, crawl_stats = ?3, updated_at = ?4
          WHERE crawl_id = ?5
          ",
        )?;
        statement.execute(params![
          CrawlStatus::Completed.to_string(),
          status_message,
          stats,
          now(),
          crawl_id
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to record crawl completion");
        anyhow!("Failed to record crawl completion")
      })?
  }

  #[instrument(skip(self, stats))]
  pub async fn update_stats(&self, crawl_id: &str, stats: &CrawlStats) -> Result<()> {
    let crawl_id = crawl_id.to_string();
    let stats = serde_json::to_string(stats)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "UPDATE crawl_jobs SET crawl_stats = ?1, updated_at = ?2 WHERE crawl_id = ?3",
        )?;
        statement.execute(params![stats, now(), crawl_id])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to update crawl stats");
        anyhow!("Failed to update crawl stats")
      })?
  }

  #[instrument(skip(self))]
  pub async fn find(&self, crawl_id: &str) -> Result<Option<CrawlJob>> {
    let crawl_id = crawl_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            &format!("SELECT {} FROM crawl_jobs WHERE crawl_id = ?1", SELECT_COLUMNS),
            params![crawl_id],
            row_to_crawl_job,
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find crawl job");
        anyhow!("Failed to find crawl job")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Most recent still-active job for the same submission target, used to
  /// fold duplicate submissions onto one crawl id.
  #[instrument(skip(self))]
  pub async fn find_active_for_target(
    &self,
    domain: Option<&str>,
    url: Option<&str>,
  ) -> Result<Option<CrawlJob>> {
    if domain.is_none() && url.is_none() {
      return Ok(None);
    }
    let domain = domain.map(|d| d.to_string());
    let url = url.map(|u| u.to_string());
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            &format!(
              "
              SELECT {}
              FROM crawl_jobs
              WHERE crawl_status IN ('fresh', 'crawling')
                AND (
                  (?1 IS NOT NULL AND json_extract(job_data, '$.domain') = ?1)
                  OR (?2 IS NOT NULL AND json_extract(job_data, '$.url') = ?2)
                )
              ORDER BY created_at DESC
              LIMIT 1
              ",
              SELECT_COLUMNS
            ),
            params![domain, url],
            row_to_crawl_job,
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to look up active crawl job");
        anyhow!("Failed to look up active crawl job")
      })?
      .map_err(|e| anyhow!(e))
  }

  #[instrument(skip(self))]
  pub async fn find_by_status(&self, status: CrawlStatus, limit: u32) -> Result<Vec<CrawlJob>> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "
          SELECT {}
          FROM crawl_jobs
          WHERE crawl_status = ?1
          ORDER BY created_at
          LIMIT ?2
          ",
          SELECT_COLUMNS
        ))?;
        let rows = statement
          .query_map(params![status.to_string(), limit], row_to_crawl_job)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to list crawl jobs");
        anyhow!("Failed to list crawl jobs")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Database liveness probe.
  pub async fn ping(&self) -> Result<()> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
      .await
      .map_err(|e| anyhow!("Database ping failed: {}", e))??;
    Ok(())
  }
}
