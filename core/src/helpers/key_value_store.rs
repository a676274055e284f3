use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct KeyValueStore {
  sqlite_connection: Arc<SqliteConnection>,
}

impl KeyValueStore {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn get<T: DeserializeOwned + Send + Sync>(&self, key: &str) -> Result<Option<T>> {
    let key = key.to_string();
    let req_key = key.clone();
    let result: Option<(Vec<u8>, Option<NaiveDateTime>)> = self
      .sqlite_connection
      .read()
      .await?
      .interact(|conn| {
        conn
          .query_row(
            "SELECT value, expires_at FROM key_value_store WHERE key = ?1",
            [req_key],
            |row| {
              let value = row.get::<_, Vec<u8>>(0)?;
              let expires_at = row.get::<_, Option<NaiveDateTime>>(1)?;
              Ok((value, expires_at))
            },
          )
          .optional()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get key value");
        anyhow!("Failed to get key value")
      })??;

    if let Some((blob, expires_at)) = result {
      if let Some(expires_at) = expires_at {
        if expires_at < chrono::Utc::now().naive_utc() {
          info!("Key value expired: {}", key);
          self.delete(&key).await?;
          return Ok(None);
        }
      }
      let value: T = serde_json::from_slice(&blob)?;
      Ok(Some(value))
    } else {
      Ok(None)
    }
  }

  pub async fn set<T: Serialize + Send + Sync>(
    &self,
    key: &str,
    value: T,
    ttl: Option<Duration>,
  ) -> Result<()> {
    let expires_at = ttl.map(|ttl| chrono::Utc::now().naive_utc() + ttl);
    let updated_at = chrono::Utc::now().naive_utc();
    let key = key.to_string();
    let value = serde_json::to_vec(&value)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          INSERT INTO key_value_store (key, value, expires_at, updated_at)
          VALUES (?1, ?2, ?3, ?4)
          ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at
          ",
        )?;
        statement.execute(params![key, value, expires_at, updated_at])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set key value");
        anyhow!("Failed to set key value")
      })?
  }

  pub async fn increment(&self, key: &str, by: i64) -> Result<i64> {
    let current = self.get::<i64>(key).await?.unwrap_or(0);
    let next = current + by;
    self.set(key, next, None).await?;
    Ok(next)
  }

  /// Set semantics over a JSON array value. Atomic within the single-writer
  /// pool; no read-your-write guarantee across processes.
  pub async fn add_to_set(&self, key: &str, member: &str) -> Result<bool> {
    let mut members = self.get::<Vec<String>>(key).await?.unwrap_or_default();
    if members.iter().any(|m| m == member) {
      return Ok(false);
    }
    members.push(member.to_string());
    self.set(key, members, None).await?;
    Ok(true)
  }

  pub async fn get_set(&self, key: &str) -> Result<Vec<String>> {
    Ok(self.get::<Vec<String>>(key).await?.unwrap_or_default())
  }

  pub async fn delete(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare("DELETE FROM key_value_store WHERE key = ?1")?;
        statement.execute(params![key])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to delete key value");
        anyhow!("Failed to delete key value")
      })?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sqlite::test_support;

  #[tokio::test]
  async fn test_set_get_roundtrip() {
    let (_dir, connection) = test_support::connection().await;
    let kv = KeyValueStore::new(connection);

    kv.set("answer", 42u32, None).await.unwrap();
    assert_eq!(kv.get::<u32>("answer").await.unwrap(), Some(42));
    assert_eq!(kv.get::<u32>("missing").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_expired_value_is_dropped() {
    let (_dir, connection) = test_support::connection().await;
    let kv = KeyValueStore::new(connection);

    kv.set("stale", 1u32, Some(Duration::seconds(-5)))
      .await
      .unwrap();
    assert_eq!(kv.get::<u32>("stale").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_set_membership() {
    let (_dir, connection) = test_support::connection().await;
    let kv = KeyValueStore::new(connection);

    assert!(kv.add_to_set("domains", "a.com").await.unwrap());
    assert!(kv.add_to_set("domains", "b.com").await.unwrap());
    assert!(!kv.add_to_set("domains", "a.com").await.unwrap());
    assert_eq!(kv.get_set("domains").await.unwrap(), vec!["a.com", "b.com"]);
  }

  #[tokio::test]
  async fn test_increment() {
    let (_dir, connection) = test_support::connection().await;
    let kv = KeyValueStore::new(connection);

    assert_eq!(kv.increment("count", 1).await.unwrap(), 1);
    assert_eq!(kv.increment("count", 2).await.unwrap(), 3);
  }
}
