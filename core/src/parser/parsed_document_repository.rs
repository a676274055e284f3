use super::parse_job_dispatcher::PageItem;
use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, instrument};
use ulid::Ulid;

pub const STATUS_PENDING_DISPATCH: &str = "pending_dispatch";
pub const STATUS_DISPATCH_COMPLETE: &str = "dispatch_complete";
pub const STATUS_PARTIAL: &str = "partial";
pub const STATUS_COMPLETE: &str = "complete";

/// One persisted page and the per-task analysis written against it.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
  pub id: String,
  pub crawl_id: Option<String>,
  pub url: String,
  pub domain: Option<String>,
  pub html_file_path: String,
  pub headers_file_path: Option<String>,
  pub item: Map<String, Value>,
  pub processing_status: String,
  pub jobs_dispatched_total: u32,
  pub jobs_failed_dispatch: u32,
  pub parser_job_ids: Vec<u64>,
  pub parser_jobs_dispatched_at: Option<NaiveDateTime>,
  pub task_results: Map<String, Value>,
  pub worker_completed_at: Map<String, Value>,
  pub initial_insert_at: NaiveDateTime,
  pub last_updated_at: NaiveDateTime,
}

fn now() -> NaiveDateTime {
  chrono::Utc::now().naive_utc()
}

fn json_map(raw: String) -> Map<String, Value> {
  serde_json::from_str(&raw).unwrap_or_default()
}

fn row_to_document(row: &Row) -> rusqlite::Result<ParsedDocument> {
  let ids: String = row.get(10)?;
  Ok(ParsedDocument {
    id: row.get(0)?,
    crawl_id: row.get(1)?,
    url: row.get(2)?,
    domain: row.get(3)?,
    html_file_path: row.get(4)?,
    headers_file_path: row.get(5)?,
    item: json_map(row.get(6)?),
    processing_status: row.get(7)?,
    jobs_dispatched_total: row.get(8)?,
    jobs_failed_dispatch: row.get(9)?,
    parser_job_ids: serde_json::from_str(&ids).unwrap_or_default(),
    parser_jobs_dispatched_at: row.get(11)?,
    task_results: json_map(row.get(12)?),
    worker_completed_at: json_map(row.get(13)?),
    initial_insert_at: row.get(14)?,
    last_updated_at: row.get(15)?,
  })
}

const SELECT_COLUMNS: &str = "
  id, crawl_id, url, domain, html_file_path, headers_file_path, item,
  processing_status, jobs_dispatched_total, jobs_failed_dispatch,
  parser_job_ids, parser_jobs_dispatched_at, task_results,
  worker_completed_at, initial_insert_at, last_updated_at
";

#[derive(Clone, Debug)]
pub struct ParsedDocumentRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

impl ParsedDocumentRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  /// Inserts the fan-out seed and returns the generated document id.
  #[instrument(skip(self, item))]
  pub async fn insert_seed(&self, item: &PageItem) -> Result<String> {
    let document_id = Ulid::new().to_string();
    let id = document_id.clone();
    let item = item.clone();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let timestamp = now();
        let mut statement = conn.prepare(
          "
          INSERT INTO parsed_documents (
            id, crawl_id, url, domain, html_file_path, headers_file_path,
            item, processing_status, initial_insert_at, last_updated_at
          )
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
          ",
        )?;
        statement.execute(params![
          id,
          item.crawl_id,
          item.url,
          item.domain,
          item.html_file_path,
          item.headers_file_path,
          serde_json::to_string(&item.custom).unwrap_or_else(|_| "{}".to_string()),
          STATUS_PENDING_DISPATCH,
          timestamp,
        ])?;
        Ok::<(), rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to insert parsed document seed");
        anyhow!("Failed to insert parsed document seed")
      })??;
    Ok(document_id)
  }

  /// Final fan-out bookkeeping; runs whether or not individual enqueues
  /// failed and records the counts either way.
  #[instrument(skip(self, parser_job_ids))]
  pub async fn record_dispatch(
    &self,
    document_id: &str,
    jobs_dispatched_total: u32,
    jobs_failed_dispatch: u32,
    parser_job_ids: &[u64],
  ) -> Result<()> {
    let document_id = document_id.to_string();
    let parser_job_ids = serde_json::to_string(parser_job_ids)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE parsed_documents
          SET processing_status = ?1,
              jobs_dispatched_total = ?2,
              jobs_failed_dispatch = ?3,
              parser_job_ids = ?4,
              parser_jobs_dispatched_at = ?5,
              last_updated_at = ?5
          WHERE id = ?6
          ",
        )?;
        statement.execute(params![
          STATUS_DISPATCH_COMPLETE,
          jobs_dispatched_total,
          jobs_failed_dispatch,
          parser_job_ids,
          now(),
          document_id,
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to record parser dispatch");
        anyhow!("Failed to record parser dispatch")
      })?
  }

  /// Writes one task's typed result under its own key so concurrent task
  /// writers commute, stamps the task completion time, and rolls the
  /// processing status forward to partial/complete as stamps accumulate.
  /// Creates the document with first-seen fields when it does not exist.
  #[instrument(skip(self, value, item))]
  pub async fn upsert_task_result(
    &self,
    document_id: &str,
    field_name: &str,
    task_type: &str,
    value: Value,
    item: &PageItem,
  ) -> Result<()> {
    let document_id = document_id.to_string();
    let field_path = format!("$.{}", field_name);
    let task_path = format!("$.{}", task_type);
    let value = serde_json::to_string(&value)?;
    let item = item.clone();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let timestamp = now();
        let tx = conn.transaction()?;
        {
          let mut statement = tx.prepare(
            "
            INSERT INTO parsed_documents (
              id, crawl_id, url, domain, html_file_path, headers_file_path,
              item, processing_status, initial_insert_at, last_updated_at,
              task_results, worker_completed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9,
                    json_set('{}', ?10, json(?11)),
                    json_set('{}', ?12, ?13))
            ON CONFLICT (id) DO UPDATE SET
              task_results = json_set(parsed_documents.task_results, ?10, json(?11)),
              worker_completed_at = json_set(parsed_documents.worker_completed_at, ?12, ?13),
              last_updated_at = ?9
            ",
          )?;
          statement.execute(params![
            document_id,
            item.crawl_id,
            item.url,
            item.domain,
            item.html_file_path,
            item.headers_file_path,
            serde_json::to_string(&item.custom).unwrap_or_else(|_| "{}".to_string()),
            STATUS_PENDING_DISPATCH,
            timestamp,
            field_path,
            value,
            task_path,
            timestamp.to_string(),
          ])?;
        }
        Self::roll_processing_status(&tx, &document_id, timestamp)?;
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to upsert task result");
        anyhow!("Failed to upsert task result")
      })?
  }

  /// Stamps a task completion without writing a result value (a handler
  /// that elected to skip the page).
  #[instrument(skip(self))]
  pub async fn record_task_completion(&self, document_id: &str, task_type: &str) -> Result<()> {
    let document_id = document_id.to_string();
    let task_path = format!("$.{}", task_type);
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let timestamp = now();
        let tx = conn.transaction()?;
        tx.execute(
          "
          UPDATE parsed_documents
          SET worker_completed_at = json_set(worker_completed_at, ?1, ?2),
              last_updated_at = ?3
          WHERE id = ?4
          ",
          params![task_path, timestamp.to_string(), timestamp, document_id],
        )?;
        Self::roll_processing_status(&tx, &document_id, timestamp)?;
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to record task completion");
        anyhow!("Failed to record task completion")
      })?
  }

  fn roll_processing_status(
    tx: &rusqlite::Transaction,
    document_id: &str,
    timestamp: NaiveDateTime,
  ) -> rusqlite::Result<()> {
    tx.execute(
      "
      UPDATE parsed_documents
      SET processing_status = CASE
            WHEN (SELECT COUNT(*) FROM json_each(worker_completed_at)) >= jobs_dispatched_total
              THEN ?1
            ELSE ?2
          END,
          last_updated_at = ?3
      WHERE id = ?4
        AND jobs_dispatched_total > 0
        AND processing_status IN (?5, ?2)
      ",
      params![
        STATUS_COMPLETE,
        STATUS_PARTIAL,
        timestamp,
        document_id,
        STATUS_DISPATCH_COMPLETE
      ],
    )?;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn find(&self, document_id: &str) -> Result<Option<ParsedDocument>> {
    let document_id = document_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn
          .query_row(
            &format!(
              "SELECT {} FROM parsed_documents WHERE id = ?1",
              SELECT_COLUMNS
            ),
            params![document_id],
            row_to_document,
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find parsed document");
        anyhow!("Failed to find parsed document")
      })?
      .map_err(|e| anyhow!(e))
  }

  #[instrument(skip(self))]
  pub async fn find_by_crawl_id(&self, crawl_id: &str) -> Result<Vec<ParsedDocument>> {
    let crawl_id = crawl_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "SELECT {} FROM parsed_documents WHERE crawl_id = ?1 ORDER BY initial_insert_at",
          SELECT_COLUMNS
        ))?;
        let rows = statement
          .query_map(params![crawl_id], row_to_document)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to list parsed documents");
        anyhow!("Failed to list parsed documents")
      })?
      .map_err(|e| anyhow!(e))
  }
}
