use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, instrument};

pub const STATUS_NEW: &str = "new";
pub const STATUS_PENDING_SUBMISSION: &str = "pending_submission";
pub const STATUS_SUBMITTED_TO_CRAWLER: &str = "submitted_to_crawler";

/// A domain awaiting or undergoing crawl scheduling.
#[derive(Debug, Clone, Default)]
pub struct SourceDomain {
  pub id: String,
  pub domain: String,
  pub url: Option<String>,
  pub status: String,
  pub max_pages: Option<u32>,
  pub single_url: Option<bool>,
  pub use_sitemap: Option<bool>,
  pub cycle_id: Option<i64>,
  pub project_id: Option<String>,
  pub custom_params: Map<String, Value>,
  pub error_message: Option<String>,
  pub crawl_id_ref: Option<String>,
  pub last_attempted_at: Option<NaiveDateTime>,
  pub last_submitted_at: Option<NaiveDateTime>,
}

fn now() -> NaiveDateTime {
  chrono::Utc::now().naive_utc()
}

fn row_to_source_domain(row: &Row) -> rusqlite::Result<SourceDomain> {
  let custom: Option<String> = row.get(9)?;
  Ok(SourceDomain {
    id: row.get(0)?,
    domain: row.get(1)?,
    url: row.get(2)?,
    status: row.get(3)?,
    max_pages: row.get(4)?,
    single_url: row.get::<_, Option<i64>>(5)?.map(|v| v != 0),
    use_sitemap: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
    cycle_id: row.get(7)?,
    project_id: row.get(8)?,
    custom_params: custom
      .and_then(|c| serde_json::from_str(&c).ok())
      .unwrap_or_default(),
    error_message: row.get(10)?,
    crawl_id_ref: row.get(11)?,
    last_attempted_at: row.get(12)?,
    last_submitted_at: row.get(13)?,
  })
}

const SELECT_COLUMNS: &str = "
  id, domain, url, status, max_pages, single_url, use_sitemap, cycle_id,
  project_id, custom_params, error_message, crawl_id_ref, last_attempted_at,
  last_submitted_at
";

#[derive(Clone, Debug)]
pub struct SourceDomainRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl SourceDomainRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip(self, record))]
  pub async fn insert(&self, record: &SourceDomain) -> Result<()> {
    let record = record.clone();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          INSERT INTO source_domains (
            id, domain, url, status, max_pages, single_url, use_sitemap,
            cycle_id, project_id, custom_params, created_at
          )
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
          ",
        )?;
        statement.execute(params![
          record.id,
          record.domain,
          record.url,
          record.status,
          record.max_pages,
          record.single_url.map(|v| v as i64),
          record.use_sitemap.map(|v| v as i64),
          record.cycle_id,
          record.project_id,
          serde_json::to_string(&record.custom_params).unwrap_or_else(|_| "{}".to_string()),
          now(),
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to insert source domain");
        anyhow!("Failed to insert source domain")
      })?
  }

  #[instrument(skip(self))]
  pub async fn find_by_status(&self, status: &str, limit: u32) -> Result<Vec<SourceDomain>> {
    let status = status.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "
          SELECT {}
          FROM source_domains
          WHERE status = ?1
          ORDER BY created_at
          LIMIT ?2
          ",
          SELECT_COLUMNS
        ))?;
        let rows = statement
          .query_map(params![status, limit], row_to_source_domain)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to list source domains");
        anyhow!("Failed to list source domains")
      })?
      .map_err(|e| anyhow!(e))
  }

  #[instrument(skip(self))]
  pub async fn find(&self, id: &str) -> Result<Option<SourceDomain>> {
    let id = id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            &format!("SELECT {} FROM source_domains WHERE id = ?1", SELECT_COLUMNS),
            params![id],
            row_to_source_domain,
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find source domain");
        anyhow!("Failed to find source domain")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Conditional status transition predicated on the current status: the
  /// two-phase admission lock. Zero rows modified means another scheduler
  /// instance won the race.
  #[instrument(skip(self))]
  pub async fn transition(&self, id: &str, from_status: &str, to_status: &str) -> Result<bool> {
    let id = id.to_string();
    let from_status = from_status.to_string();
    let to_status = to_status.to_string();
    let modified = self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE source_domains
          SET status = ?1, last_attempted_at = ?2
          WHERE id = ?3 AND status = ?4
          ",
        )?;
        statement.execute(params![to_status, now(), id, from_status])
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to transition source domain");
        anyhow!("Failed to transition source domain")
      })??;
    Ok(modified > 0)
  }

  #[instrument(skip(self))]
  pub async fn mark_submitted(&self, id: &str, to_status: &str, crawl_id: &str) -> Result<()> {
    let id = id.to_string();
    let to_status = to_status.to_string();
    let crawl_id = crawl_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE source_domains
          SET status = ?1, crawl_id_ref = ?2, last_submitted_at = ?3, error_message = NULL
          WHERE id = ?4
          ",
        )?;
        statement.execute(params![to_status, crawl_id, now(), id])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to mark source domain submitted");
        anyhow!("Failed to mark source domain submitted")
      })?
  }

  /// Reverts a failed admission back to its original status, conditional on
  /// the record still holding the in-flight status.
  #[instrument(skip(self))]
  pub async fn revert(
    &self,
    id: &str,
    from_status: &str,
    to_status: &str,
    error_message: &str,
  ) -> Result<bool> {
    let id = id.to_string();
    let from_status = from_status.to_string();
    let to_status = to_status.to_string();
    let error_message: String = error_message.chars().take(500).collect();
    let modified = self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE source_domains
          SET status = ?1, error_message = ?2
          WHERE id = ?3 AND status = ?4
          ",
        )?;
        statement.execute(params![to_status, error_message, id, from_status])
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to revert source domain");
        anyhow!("Failed to revert source domain")
      })??;
    Ok(modified > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sqlite::test_support;

  fn domain_record(id: &str, domain: &str) -> SourceDomain {
    SourceDomain {
      id: id.to_string(),
      domain: domain.to_string(),
      status: STATUS_NEW.to_string(),
      ..Default::default()
    }
  }

  async fn repository() -> (tempfile::TempDir, SourceDomainRepository) {
    let (dir, connection) = test_support::connection().await;
    (dir, SourceDomainRepository::new(connection))
  }

  #[tokio::test]
  async fn test_transition_is_conditional_on_current_status() {
    let (_dir, repo) = repository().await;
    repo.insert(&domain_record("d-1", "a.com")).await.unwrap();

    assert!(repo
      .transition("d-1", STATUS_NEW, STATUS_PENDING_SUBMISSION)
      .await
      .unwrap());
    // second locker loses the race
    assert!(!repo
      .transition("d-1", STATUS_NEW, STATUS_PENDING_SUBMISSION)
      .await
      .unwrap());

    let record = repo.find("d-1").await.unwrap().unwrap();
    assert_eq!(record.status, STATUS_PENDING_SUBMISSION);
    assert!(record.last_attempted_at.is_some());
  }

  #[tokio::test]
  async fn test_mark_submitted_records_crawl_reference() {
    let (_dir, repo) = repository().await;
    repo.insert(&domain_record("d-2", "b.com")).await.unwrap();
    repo
      .transition("d-2", STATUS_NEW, STATUS_PENDING_SUBMISSION)
      .await
      .unwrap();
    repo
      .mark_submitted("d-2", STATUS_SUBMITTED_TO_CRAWLER, "c-9")
      .await
      .unwrap();

    let record = repo.find("d-2").await.unwrap().unwrap();
    assert_eq!(record.status, STATUS_SUBMITTED_TO_CRAWLER);
    assert_eq!(record.crawl_id_ref.as_deref(), Some("c-9"));
  }

  #[tokio::test]
  async fn test_revert_restores_status_with_error_note() {
    let (_dir, repo) = repository().await;
    repo.insert(&domain_record("d-3", "c.com")).await.unwrap();
    repo
      .transition("d-3", STATUS_NEW, STATUS_PENDING_SUBMISSION)
      .await
      .unwrap();

    assert!(repo
      .revert("d-3", STATUS_PENDING_SUBMISSION, STATUS_NEW, "broker unavailable")
      .await
      .unwrap());

    let record = repo.find("d-3").await.unwrap().unwrap();
    assert_eq!(record.status, STATUS_NEW);
    assert_eq!(record.error_message.as_deref(), Some("broker unavailable"));
  }

  #[tokio::test]
  async fn test_find_by_status_orders_by_insertion() {
    let (_dir, repo) = repository().await;
    for i in 0..3 {
      repo
        .insert(&domain_record(&format!("d-{}", i), &format!("{}.com", i)))
        .await
        .unwrap();
    }

    let records = repo.find_by_status(STATUS_NEW, 2).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "d-0");
  }
}
