use super::crawl_job::{CrawlJobData, CrawlStats};
use super::crawl_job_repository::CrawlJobRepository;
use crate::files::content_store::ContentStore;
use crate::helpers::key_value_store::KeyValueStore;
use crate::parser::parse_job_dispatcher::{PageItem, ParseJobDispatcher};
use crate::settings::CrawlerSettings;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Proxy;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde_json::{Map, Value};
use std::{
  collections::{HashSet, VecDeque},
  sync::Arc,
  time::Duration,
};
use tokio::time::sleep;
use tokio_retry::{strategy::FibonacciBackoff, Retry};
use tracing::{debug, info, instrument, warn};

const WINDOW_REQUEST_COUNT_KEY: &str = "crawler:window_request_count";
const JS_RENDER_DOMAINS_KEY: &str = "crawler:js_render_domains";
const FETCH_RETRIES: usize = 3;
const MAX_FRONTIER_FACTOR: usize = 10;
const JS_TEXT_THRESHOLD: usize = 150;
const JS_SCRIPT_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
pub struct CrawlOutcome {
  pub stats: CrawlStats,
}

/// Everything an engine needs to persist pages and fan out parser work.
pub struct CrawlContext {
  pub crawl_id: String,
  pub content_store: Arc<ContentStore>,
  pub dispatcher: Arc<ParseJobDispatcher>,
  pub crawl_jobs: Arc<CrawlJobRepository>,
}

/// The external crawl subsystem at its interface to the dispatcher: fetch
/// pages, persist them through the content store, fan each one out, keep
/// `crawl_stats` current, and report success or failure on exit.
#[async_trait]
pub trait CrawlEngine: Send + Sync {
  async fn run(&self, job: &CrawlJobData, ctx: &CrawlContext) -> Result<CrawlOutcome>;
}

/// In-process conforming engine: a same-domain frontier crawl with a soft
/// max-pages cap, optional sitemap seeding, bounded fetch retries and a
/// shared rate-limit window.
pub struct HttpCrawlEngine {
  settings: CrawlerSettings,
  client: ClientWithMiddleware,
  kv: Arc<KeyValueStore>,
}

fn normalize_link(url: reqwest::Url) -> String {
  let mut url = url;
  url.set_fragment(None);
  url.to_string()
}

pub fn extract_links(html: &str, base: &reqwest::Url) -> Vec<String> {
  let Ok(dom) = tl::parse(html, tl::ParserOptions::default()) else {
    return Vec::new();
  };
  let page_host = base.host_str().unwrap_or_default().to_string();
  let mut links = Vec::new();
  let mut seen = HashSet::new();

  for tag in crate::parser::dom::select_tags(&dom, "a") {
    let Some(href) = crate::parser::dom::attr(tag, "href") else {
      continue;
    };
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
      continue;
    }
    let Ok(joined) = base.join(&href) else {
      continue;
    };
    if !matches!(joined.scheme(), "http" | "https") {
      continue;
    }
    if joined.host_str() != Some(page_host.as_str()) {
      continue;
    }
    let normalized = normalize_link(joined);
    if seen.insert(normalized.clone()) {
      links.push(normalized);
    }
  }
  links
}

/// Minimal `<loc>` extraction; enough for the plain urlset/sitemapindex
/// documents the crawler seeds from.
pub fn extract_sitemap_locs(xml: &str, limit: usize) -> Vec<String> {
  let mut locs = Vec::new();
  let mut rest = xml;
  while let Some(start) = rest.find("<loc>") {
    let after = &rest[start + 5..];
    let Some(end) = after.find("</loc>") else {
      break;
    };
    let loc = after[..end].trim().to_string();
    if !loc.is_empty() {
      locs.push(loc);
      if locs.len() >= limit {
        break;
      }
    }
    rest = &after[end + 6..];
  }
  locs
}

/// Heuristic for pages that ship an empty shell and render client-side.
pub fn looks_js_rendered(html: &str) -> bool {
  let script_count = html.matches("<script").count();
  if script_count < JS_SCRIPT_THRESHOLD {
    return false;
  }
  let visible_text = tl::parse(html, tl::ParserOptions::default())
    .ok()
    .and_then(|dom| {
      crate::parser::dom::select_first(&dom, "body")
        .map(|body| crate::parser::dom::inner_text(&dom, body))
    })
    .unwrap_or_default();
  visible_text.len() < JS_TEXT_THRESHOLD
}

fn headers_to_json(headers: &reqwest::header::HeaderMap) -> Value {
  let mut map = Map::new();
  for (name, value) in headers {
    map.insert(
      name.as_str().to_string(),
      Value::String(String::from_utf8_lossy(value.as_bytes()).to_string()),
    );
  }
  Value::Object(map)
}

impl HttpCrawlEngine {
  pub fn new(settings: CrawlerSettings, kv: Arc<KeyValueStore>) -> Result<Self> {
    let mut base_client_builder = reqwest::ClientBuilder::new()
      .timeout(Duration::from_secs(settings.request_timeout_seconds))
      .user_agent(settings.user_agent.clone());
    if let Some(proxy_settings) = &settings.proxy {
      base_client_builder = base_client_builder.proxy(
        Proxy::all(format!("{}:{}", proxy_settings.host, proxy_settings.port))?.basic_auth(
          proxy_settings.username.as_str(),
          proxy_settings.password.as_str(),
        ),
      );
    }
    let base_client = base_client_builder
      .build()
      .map_err(|error| anyhow!(error.to_string()))?;

    let client = ClientBuilder::new(base_client)
      .with(TracingMiddleware::default())
      .build();

    Ok(Self {
      settings,
      client,
      kv,
    })
  }

  async fn enforce_rate_window(&self) -> Result<bool> {
    let count = self.kv.increment(WINDOW_REQUEST_COUNT_KEY, 1).await?;
    Ok(count <= self.settings.rate_limit.max_requests as i64)
  }

  #[instrument(skip(self))]
  async fn fetch(&self, url: &str) -> Result<reqwest::Response> {
    Retry::spawn(FibonacciBackoff::from_millis(500).take(FETCH_RETRIES), || async {
      self.client.get(url).send().await
    })
    .await
    .map_err(|e| anyhow!("Failed to fetch {} after {} retries: {:?}", url, FETCH_RETRIES, e))
  }

  fn start_url(&self, job: &CrawlJobData) -> Result<String> {
    if let Some(url) = &job.url {
      return Ok(url.clone());
    }
    job
      .domain
      .as_ref()
      .map(|domain| format!("https://{}/", domain))
      .ok_or_else(|| anyhow!("Crawl job has neither domain nor url"))
  }

  async fn seed_frontier(&self, job: &CrawlJobData, start: &str) -> Result<VecDeque<String>> {
    let mut frontier = VecDeque::new();
    frontier.push_back(start.to_string());

    if job.use_sitemap && !job.single_url {
      let base = reqwest::Url::parse(start)?;
      let sitemap_url = base.join("/sitemap.xml")?.to_string();
      match self.fetch(&sitemap_url).await {
        Ok(response) if response.status().is_success() => {
          let xml = response.text().await.unwrap_or_default();
          let locs = extract_sitemap_locs(&xml, job.max_pages as usize * 2);
          info!(count = locs.len(), "Seeded frontier from sitemap");
          frontier.extend(locs);
        }
        Ok(response) => {
          debug!(status = response.status().as_u16(), "No usable sitemap");
        }
        Err(e) => {
          debug!(error = e.to_string(), "Sitemap fetch failed");
        }
      }
    }
    Ok(frontier)
  }
}

#[async_trait]
impl CrawlEngine for HttpCrawlEngine {
  #[instrument(skip(self, job, ctx), fields(crawl_id = ctx.crawl_id.as_str()))]
  async fn run(&self, job: &CrawlJobData, ctx: &CrawlContext) -> Result<CrawlOutcome> {
    let mut stats = CrawlStats {
      start_time: Some(Utc::now()),
      ..Default::default()
    };

    let start = self.start_url(job)?;
    let base = reqwest::Url::parse(&start)?;
    let domain = job
      .domain
      .clone()
      .or_else(|| base.host_str().map(|h| h.to_string()))
      .ok_or_else(|| anyhow!("Cannot determine domain for {}", start))?;

    let mut frontier = self.seed_frontier(job, &start).await?;
    let mut visited: HashSet<String> = HashSet::new();
    let frontier_cap = job.max_pages as usize * MAX_FRONTIER_FACTOR;

    while let Some(url) = frontier.pop_front() {
      if stats.pages_crawled >= job.max_pages {
        break;
      }
      if !visited.insert(url.clone()) {
        stats.pages_skipped += 1;
        continue;
      }
      if !self.enforce_rate_window().await? {
        warn!("Rate limit window exhausted, stopping crawl");
        stats
          .crawl_errors
          .push("rate limit window exhausted".to_string());
        break;
      }

      let response = match self.fetch(&url).await {
        Ok(response) => response,
        Err(e) => {
          warn!(url = url.as_str(), error = e.to_string(), "Fetch failed");
          stats.crawl_errors.push(format!("{}: {}", url, e));
          continue;
        }
      };

      let status = response.status();
      stats.record_status_code(status.as_u16());
      if !status.is_success() {
        debug!(url = url.as_str(), status = status.as_u16(), "Skipping non-success response");
        stats.pages_skipped += 1;
        continue;
      }

      let headers = headers_to_json(response.headers());
      let html = response.text().await.unwrap_or_default();

      if looks_js_rendered(&html) && !stats.js_render_domains.contains(&domain) {
        self.kv.add_to_set(JS_RENDER_DOMAINS_KEY, &domain).await?;
        stats.js_render_domains.push(domain.clone());
      }

      let stored = ctx
        .content_store
        .put(&domain, &url, html.as_bytes(), &headers)
        .await?;
      stats.pages_crawled += 1;

      let item = PageItem {
        url: url.clone(),
        domain: Some(domain.clone()),
        crawl_id: Some(ctx.crawl_id.clone()),
        html_file_path: stored.html_path.to_string_lossy().to_string(),
        headers_file_path: Some(stored.headers_path.to_string_lossy().to_string()),
        status: Some(status.as_u16()),
        custom: Map::new(),
      };
      match ctx.dispatcher.dispatch_page(&item).await {
        Ok(summary) => {
          stats.parse_jobs_created += summary.jobs_dispatched;
        }
        Err(e) => {
          warn!(url = url.as_str(), error = e.to_string(), "Fan-out failed for page");
          stats.crawl_errors.push(format!("dispatch {}: {}", url, e));
        }
      }

      if !job.single_url && visited.len() + frontier.len() < frontier_cap {
        for link in extract_links(&html, &base) {
          if !visited.contains(&link) {
            frontier.push_back(link);
          }
        }
      }

      ctx.crawl_jobs.update_stats(&ctx.crawl_id, &stats).await?;
      sleep(Duration::from_millis(self.settings.request_delay_ms)).await;
    }

    let end = Utc::now();
    stats.end_time = Some(end);
    stats.duration_seconds = stats
      .start_time
      .map(|start| (end - start).num_milliseconds() as f64 / 1000.0);
    ctx.crawl_jobs.update_stats(&ctx.crawl_id, &stats).await?;

    info!(
      pages_crawled = stats.pages_crawled,
      pages_skipped = stats.pages_skipped,
      "Crawl engine finished"
    );
    Ok(CrawlOutcome { stats })
  }
}
