use crate::settings::ContentStoreSettings;
use anyhow::{anyhow, Context, Result};
use data_encoding::HEXLOWER;
use fs2::FileExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
  fs::{File, OpenOptions},
  io::{Read, Write},
  os::unix::fs::DirBuilderExt,
  path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

const MAX_FILE_NAME_LENGTH: usize = 200;
const QUERY_HASH_LENGTH: usize = 8;

/// Locations of one persisted page.
#[derive(Debug, Clone)]
pub struct StoredPage {
  pub html_path: PathBuf,
  pub headers_path: PathBuf,
  pub domain_dir: PathBuf,
  pub file_name: String,
}

/// Filesystem page store. Paths are deterministic per (domain, url); writes
/// hold an exclusive advisory lock and fsync before returning, reads hold a
/// shared lock.
#[derive(Debug, Clone)]
pub struct ContentStore {
  root: PathBuf,
}

pub fn normalized_domain(domain: &str) -> String {
  let domain = domain.to_lowercase().replace(':', "_");
  domain
    .strip_prefix("www.")
    .map(|d| d.to_string())
    .unwrap_or(domain)
}

fn short_hash(input: &str) -> String {
  let digest = Sha256::digest(input.as_bytes());
  HEXLOWER.encode(&digest)[..QUERY_HASH_LENGTH].to_string()
}

/// Derives the stored file name from the URL path: leading slash stripped,
/// remaining slashes flattened to underscores, empty path becomes "index",
/// query strings keyed by a short hash, overlong names truncated with a
/// hash suffix, and ".html" appended unless the name already carries a
/// ".txt" or ".xml" extension.
pub fn derive_file_name(url: &str) -> Result<String> {
  let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid url: {}", url))?;

  let mut name = parsed.path().trim_matches('/').replace('/', "_");
  if name.is_empty() {
    name = "index".to_string();
  }

  if let Some(query) = parsed.query() {
    if !query.is_empty() {
      name = format!("{}_q{}", name, short_hash(query));
    }
  }

  if !(name.ends_with(".txt") || name.ends_with(".xml")) {
    name = format!("{}.html", name);
  }

  if name.len() > MAX_FILE_NAME_LENGTH {
    let hash = short_hash(&name);
    name = format!("{}_{}.html", &name[..MAX_FILE_NAME_LENGTH - 14], hash);
  }

  Ok(name)
}

fn write_locked(path: &Path, bytes: &[u8]) -> Result<()> {
  let file = OpenOptions::new()
    .create(true)
    .write(true)
    .truncate(true)
    .open(path)?;
  FileExt::lock_exclusive(&file)?;
  let result = (|| -> Result<()> {
    let mut file_ref = &file;
    file_ref.write_all(bytes)?;
    file_ref.flush()?;
    file.sync_all()?;
    Ok(())
  })();
  let _ = FileExt::unlock(&file);
  result
}

fn read_locked(path: &Path) -> Result<Vec<u8>> {
  let file = File::open(path).with_context(|| format!("File not found: {}", path.display()))?;
  FileExt::lock_shared(&file)?;
  let mut bytes = Vec::new();
  let result = (&file).read_to_end(&mut bytes);
  let _ = FileExt::unlock(&file);
  result?;
  Ok(bytes)
}

impl ContentStore {
  pub fn new(settings: &ContentStoreSettings) -> Result<Self> {
    let store = Self {
      root: PathBuf::from(&settings.dir),
    };
    store.ensure_dir(&store.root)?;
    Ok(store)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn ensure_dir(&self, dir: &Path) -> Result<()> {
    if !dir.exists() {
      std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
  }

  pub fn page_paths(&self, domain: &str, url: &str) -> Result<StoredPage> {
    let domain_dir = self.root.join(normalized_domain(domain));
    let file_name = derive_file_name(url)?;
    let html_path = domain_dir.join(&file_name);
    let headers_path = domain_dir.join(format!("{}.headers.json", file_name));
    Ok(StoredPage {
      html_path,
      headers_path,
      domain_dir,
      file_name,
    })
  }

  /// Persists a page and its response headers. The HTML write is fsynced
  /// before this returns so downstream parse jobs never observe a partial
  /// file.
  #[instrument(skip(self, html, headers))]
  pub async fn put(
    &self,
    domain: &str,
    url: &str,
    html: &[u8],
    headers: &Value,
  ) -> Result<StoredPage> {
    let stored = self.page_paths(domain, url)?;
    self.ensure_dir(&stored.domain_dir)?;

    let html_path = stored.html_path.clone();
    let headers_path = stored.headers_path.clone();
    let html = html.to_vec();
    let headers_bytes = serde_json::to_vec(headers)?;

    tokio::task::spawn_blocking(move || -> Result<()> {
      write_locked(&html_path, &html)?;
      write_locked(&headers_path, &headers_bytes)?;
      Ok(())
    })
    .await
    .map_err(|e| anyhow!("Content store write task failed: {}", e))??;

    debug!(path = %stored.html_path.display(), "Stored page content");
    Ok(stored)
  }

  pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_locked(&path))
      .await
      .map_err(|e| anyhow!("Content store read task failed: {}", e))?
  }

  pub fn list_files(&self, domain: Option<&str>, max_files: usize) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let domain_dirs: Vec<PathBuf> = match domain {
      Some(domain) => vec![self.root.join(normalized_domain(domain))],
      None => std::fs::read_dir(&self.root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect(),
    };

    for dir in domain_dirs {
      if !dir.exists() {
        continue;
      }
      for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let is_html = path
          .extension()
          .map(|ext| ext == "html" || ext == "txt" || ext == "xml")
          .unwrap_or(false);
        if is_html && !path.to_string_lossy().ends_with(".headers.json") {
          files.push(path);
          if files.len() >= max_files {
            return Ok(files);
          }
        }
      }
    }
    Ok(files)
  }

  pub fn cleanup_older_than(&self, days: u32) -> Result<u32> {
    let cutoff = std::time::SystemTime::now()
      - std::time::Duration::from_secs(days as u64 * 24 * 60 * 60);
    let mut deleted = 0;

    for path in self.list_files(None, usize::MAX)? {
      let modified = std::fs::metadata(&path).and_then(|m| m.modified());
      if matches!(modified, Ok(modified) if modified < cutoff) {
        std::fs::remove_file(&path)?;
        let headers = PathBuf::from(format!("{}.headers.json", path.display()));
        if headers.exists() {
          std::fs::remove_file(&headers)?;
        }
        deleted += 1;
      }
    }

    info!(deleted, days, "Cleaned up old content files");
    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn store() -> (TempDir, ContentStore) {
    let dir = TempDir::new().unwrap();
    let store = ContentStore::new(&ContentStoreSettings {
      dir: dir.path().to_string_lossy().to_string(),
    })
    .unwrap();
    (dir, store)
  }

  #[test]
  fn test_normalized_domain() {
    assert_eq!(normalized_domain("WWW.Example.COM"), "example.com");
    assert_eq!(normalized_domain("example.com:8080"), "example.com_8080");
    assert_eq!(normalized_domain("sub.example.com"), "sub.example.com");
  }

  #[test]
  fn test_derive_file_name() {
    assert_eq!(
      derive_file_name("https://example.com/").unwrap(),
      "index.html"
    );
    assert_eq!(
      derive_file_name("https://example.com/a/b/c").unwrap(),
      "a_b_c.html"
    );
    assert_eq!(
      derive_file_name("https://example.com/robots.txt").unwrap(),
      "robots.txt"
    );
    assert_eq!(
      derive_file_name("https://example.com/sitemap.xml").unwrap(),
      "sitemap.xml"
    );

    let with_query = derive_file_name("https://example.com/search?q=rust").unwrap();
    assert!(with_query.starts_with("search_q"));
    assert!(with_query.ends_with(".html"));
    assert_ne!(
      with_query,
      derive_file_name("https://example.com/search?q=other").unwrap()
    );
  }

  #[test]
  fn test_overlong_file_name_is_truncated() {
    let url = format!("https://example.com/{}", "segment/".repeat(60));
    let name = derive_file_name(&url).unwrap();
    assert!(name.len() <= MAX_FILE_NAME_LENGTH + 8);
    assert!(name.ends_with(".html"));
  }

  #[tokio::test]
  async fn test_put_and_read_roundtrip() {
    let (_dir, store) = store();
    let headers = serde_json::json!({"content-type": "text/html"});

    let stored = store
      .put(
        "www.Example.com",
        "https://example.com/about/team",
        b"<html>team</html>",
        &headers,
      )
      .await
      .unwrap();

    assert!(stored.html_path.ends_with("example.com/about_team.html"));
    assert!(stored.headers_path.exists());

    let bytes = store.read(&stored.html_path).await.unwrap();
    assert_eq!(bytes, b"<html>team</html>");

    let header_bytes = store.read(&stored.headers_path).await.unwrap();
    let parsed: Value = serde_json::from_slice(&header_bytes).unwrap();
    assert_eq!(parsed["content-type"], "text/html");
  }

  #[tokio::test]
  async fn test_put_is_deterministic_and_overwrites() {
    let (_dir, store) = store();
    let headers = serde_json::json!({});

    let first = store
      .put("example.com", "https://example.com/a", b"one", &headers)
      .await
      .unwrap();
    let second = store
      .put("example.com", "https://example.com/a", b"two", &headers)
      .await
      .unwrap();

    assert_eq!(first.html_path, second.html_path);
    assert_eq!(store.read(&first.html_path).await.unwrap(), b"two");
  }

  #[tokio::test]
  async fn test_cleanup_only_removes_old_files() {
    let (_dir, store) = store();
    let headers = serde_json::json!({});
    let stored = store
      .put("example.com", "https://example.com/a", b"a", &headers)
      .await
      .unwrap();

    assert_eq!(store.cleanup_older_than(30).unwrap(), 0);
    assert!(stored.html_path.exists());

    // age the file past the cutoff
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(40 * 24 * 60 * 60);
    let file = File::options().write(true).open(&stored.html_path).unwrap();
    file.set_times(std::fs::FileTimes::new().set_modified(old)).unwrap();
    drop(file);

    assert_eq!(store.cleanup_older_than(30).unwrap(), 1);
    assert!(!stored.html_path.exists());
    assert!(!stored.headers_path.exists());
  }

  #[tokio::test]
  async fn test_list_files_skips_headers() {
    let (_dir, store) = store();
    let headers = serde_json::json!({});
    store
      .put("example.com", "https://example.com/a", b"a", &headers)
      .await
      .unwrap();
    store
      .put("example.com", "https://example.com/b", b"b", &headers)
      .await
      .unwrap();

    let files = store.list_files(Some("example.com"), 50).unwrap();
    assert_eq!(files.len(), 2);
  }
}
