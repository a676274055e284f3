#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct SqliteSettings {
  pub dir: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct ContentStoreSettings {
  pub dir: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct QueueSettings {
  pub ttr_seconds: u32,
  pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct RateLimitSettings {
  pub max_requests: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
  pub host: String,
  pub port: u16,
  pub username: String,
  pub password: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct CrawlerSettings {
  pub instances: u32,
  pub max_pages: u32,
  pub use_sitemap: bool,
  pub request_timeout_seconds: u64,
  pub request_delay_ms: u64,
  pub user_agent: String,
  pub rate_limit: RateLimitSettings,
  pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct IngestSettings {
  pub interval_seconds: u64,
  pub buffer_factor: f64,
  pub source_status: String,
  pub pending_status: String,
  pub submitted_status: String,
  pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct SupervisorSettings {
  pub health_check_interval_seconds: u64,
  pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq)]
pub struct Settings {
  pub sqlite: SqliteSettings,
  pub content_store: ContentStoreSettings,
  pub queue: QueueSettings,
  pub crawler: CrawlerSettings,
  pub ingest: IngestSettings,
  pub supervisor: SupervisorSettings,
}

impl Settings {
  pub fn new() -> Result<Self, config::ConfigError> {
    let s = config::Config::builder()
      .add_source(config::Environment::default())
      .set_default("sqlite.dir", "data")?
      .set_default("content_store.dir", "data/html")?
      .set_default("queue.ttr_seconds", 300)?
      .set_default("queue.max_attempts", 3)?
      .set_default("crawler.instances", 2)?
      .set_default("crawler.max_pages", 25)?
      .set_default("crawler.use_sitemap", false)?
      .set_default("crawler.request_timeout_seconds", 30)?
      .set_default("crawler.request_delay_ms", 250)?
      .set_default("crawler.user_agent", "trawler/0.1")?
      .set_default("crawler.rate_limit.max_requests", 600)?
      .set_default("ingest.interval_seconds", 300)?
      .set_default("ingest.buffer_factor", 1.5)?
      .set_default("ingest.source_status", "new")?
      .set_default("ingest.pending_status", "pending_submission")?
      .set_default("ingest.submitted_status", "submitted_to_crawler")?
      .set_default("supervisor.health_check_interval_seconds", 60)?
      .set_default("supervisor.shutdown_timeout_seconds", 30)?
      .build()?;

    Ok(s.try_deserialize()?)
  }
}
