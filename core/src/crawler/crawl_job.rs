use crate::queue::job_codec::{JobKind, JobRecord};
use crate::settings::CrawlerSettings;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CrawlStatus {
  Fresh,
  Crawling,
  Completed,
  Failed,
  FailedException,
}

impl CrawlStatus {
  /// Active jobs block a second submission for the same target.
  pub fn is_active(&self) -> bool {
    matches!(self, CrawlStatus::Fresh | CrawlStatus::Crawling)
  }
}

/// The original submission payload, preserved verbatim on the job record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CrawlJobData {
  pub domain: Option<String>,
  pub url: Option<String>,
  pub max_pages: u32,
  pub single_url: bool,
  pub use_sitemap: bool,
  #[serde(default)]
  pub cycle_id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project_id: Option<String>,
  #[serde(flatten)]
  pub custom_params: Map<String, Value>,
}

impl CrawlJobData {
  /// A url-scoped submission always crawls exactly that one page.
  pub fn apply_url_defaults(&mut self) {
    if self.url.is_some() {
      self.single_url = true;
      self.max_pages = 1;
      self.use_sitemap = false;
    }
  }

  pub fn target(&self) -> &str {
    self
      .domain
      .as_deref()
      .or(self.url.as_deref())
      .unwrap_or("unknown")
  }

  pub fn from_record(record: &JobRecord, defaults: &CrawlerSettings) -> Result<Self> {
    if record.job_type != JobKind::Crawl {
      return Err(anyhow!("Not a crawl record"));
    }
    let mut data = CrawlJobData {
      domain: record.domain.clone(),
      url: record.url.clone(),
      max_pages: record.max_pages.unwrap_or(defaults.max_pages),
      single_url: record.single_url.unwrap_or(false),
      use_sitemap: record.use_sitemap.unwrap_or(defaults.use_sitemap),
      cycle_id: record.cycle_id.unwrap_or(0),
      project_id: record.project_id.clone(),
      custom_params: record.extra.clone(),
    };
    data.apply_url_defaults();
    Ok(data)
  }

  pub fn to_record(&self, crawl_id: &str) -> JobRecord {
    let mut record = JobRecord::new(JobKind::Crawl);
    record.crawl_id = Some(crawl_id.to_string());
    record.domain = self.domain.clone();
    record.url = self.url.clone();
    record.max_pages = Some(self.max_pages);
    record.single_url = Some(self.single_url);
    record.use_sitemap = Some(self.use_sitemap);
    record.cycle_id = Some(self.cycle_id);
    record.project_id = self.project_id.clone();
    record.submitted_at = Some(Utc::now());
    record.extra = self.custom_params.clone();
    record
  }
}

/// Rolling counters written by the crawl engine as it progresses.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CrawlStats {
  pub pages_crawled: u32,
  pub pages_skipped: u32,
  pub status_codes: HashMap<String, u32>,
  pub js_render_domains: Vec<String>,
  pub parse_jobs_created: u32,
  pub crawl_errors: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub duration_seconds: Option<f64>,
}

impl CrawlStats {
  pub fn record_status_code(&mut self, status: u16) {
    *self.status_codes.entry(status.to_string()).or_insert(0) += 1;
  }
}

#[derive(Debug, Clone)]
pub struct CrawlJob {
  pub crawl_id: String,
  pub job_id: Option<u64>,
  pub job_data: CrawlJobData,
  pub crawl_status: CrawlStatus,
  pub status_message: Option<String>,
  pub error_message: Option<String>,
  pub crawl_stats: Option<CrawlStats>,
  pub created_at: NaiveDateTime,
  pub updated_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_url_submission_forces_single_page() {
    let mut data = CrawlJobData {
      url: Some("https://example.com/a".to_string()),
      max_pages: 50,
      use_sitemap: true,
      ..Default::default()
    };
    data.apply_url_defaults();
    assert!(data.single_url);
    assert_eq!(data.max_pages, 1);
    assert!(!data.use_sitemap);
  }

  #[test]
  fn test_record_roundtrip_carries_custom_params() {
    let mut data = CrawlJobData {
      domain: Some("example.com".to_string()),
      max_pages: 10,
      ..Default::default()
    };
    data
      .custom_params
      .insert("renderer_pool".to_string(), serde_json::json!("chromium"));

    let record = data.to_record("c-1");
    let restored = CrawlJobData::from_record(&record, &CrawlerSettings::default()).unwrap();
    assert_eq!(restored.domain.as_deref(), Some("example.com"));
    assert_eq!(
      restored.custom_params.get("renderer_pool"),
      Some(&serde_json::json!("chromium"))
    );
  }

  #[test]
  fn test_status_string_roundtrip() {
    use std::str::FromStr;
    assert_eq!(CrawlStatus::FailedException.to_string(), "failed_exception");
    assert_eq!(
      CrawlStatus::from_str("crawling").unwrap(),
      CrawlStatus::Crawling
    );
    assert!(CrawlStatus::Fresh.is_active());
    assert!(!CrawlStatus::Completed.is_active());
  }
}
