//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CacheEntry, CacheRegion, EntryMetadata};
use crate::db;

/// Trait for cache storage backends.
///
/// Callers pass the current time explicitly so expiry is decided in one place.
pub trait CacheStorage: Send + Sync {
  /// Insert or overwrite an entry, resetting its age. Returns the stored entry.
  fn put(
    &self,
    key: &str,
    payload: &Value,
    ttl_seconds: Option<u64>,
    now: DateTime<Utc>,
  ) -> Result<CacheEntry>;

  /// Read an entry without applying expiry.
  fn peek(&self, key: &str) -> Result<Option<CacheEntry>>;

  fn delete(&self, key: &str) -> Result<()>;

  fn clear(&self) -> Result<()>;

  /// All stored keys, expired or not, sorted.
  fn keys(&self) -> Result<Vec<String>>;

  /// Number of stored entries already past their TTL.
  fn count_expired(&self, now: DateTime<Utc>) -> Result<usize>;

  /// Remove every expired entry, returning how many were removed.
  fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;

  /// Read a live entry. Expired entries are deleted and reported absent.
  fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
    match self.peek(key)? {
      Some(entry) if entry.is_expired(now) => {
        self.delete(key)?;
        Ok(None)
      }
      other => Ok(other),
    }
  }

  fn exists(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
    Ok(self.get(key, now)?.is_some())
  }

  fn metadata(&self, key: &str, now: DateTime<Utc>) -> Result<Option<EntryMetadata>> {
    Ok(self.peek(key)?.map(|entry| entry.metadata(now)))
  }

  /// Delete every key starting with `prefix`.
  fn delete_prefix(&self, prefix: &str) -> Result<usize> {
    let doomed: Vec<String> = self
      .keys()?
      .into_iter()
      .filter(|k| k.starts_with(prefix))
      .collect();
    for key in &doomed {
      self.delete(key)?;
    }
    Ok(doomed.len())
  }
}

/// Storage that keeps entries in a process-local map.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn put(
    &self,
    key: &str,
    payload: &Value,
    ttl_seconds: Option<u64>,
    now: DateTime<Utc>,
  ) -> Result<CacheEntry> {
    let mut entries = self.lock()?;
    let mut entry = CacheEntry::new(key, payload.clone(), ttl_seconds, now);
    if let Some(previous) = entries.get(key) {
      entry.version = previous.version + 1;
    }
    entries.insert(key.to_string(), entry.clone());
    Ok(entry)
  }

  fn peek(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }

  fn count_expired(&self, now: DateTime<Utc>) -> Result<usize> {
    Ok(self.lock()?.values().filter(|e| e.is_expired(now)).count())
  }

  fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
    let mut entries = self.lock()?;
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    Ok(before - entries.len())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache key; region mirrors the key prefix
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    region TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    ttl_seconds INTEGER,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_region ON cache_entries(region);
CREATE INDEX IF NOT EXISTS idx_cache_entries_created ON cache_entries(created_at);
"#;

/// Expiry predicate shared by the counting and sweeping queries.
const EXPIRED: &str = "ttl_seconds IS NOT NULL AND ?1 > created_at + ttl_seconds * 1000";

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for SqliteStorage {
  fn put(
    &self,
    key: &str,
    payload: &Value,
    ttl_seconds: Option<u64>,
    now: DateTime<Utc>,
  ) -> Result<CacheEntry> {
    let conn = self.lock()?;
    let data =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    // Unrepresentable TTLs are stored as "never expires"
    let ttl_seconds = ttl_seconds.and_then(|ttl| i64::try_from(ttl).ok());

    let version: i64 = conn
      .query_row(
        "INSERT INTO cache_entries (cache_key, region, payload, created_at, ttl_seconds, version)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)
         ON CONFLICT(cache_key) DO UPDATE SET
           region = excluded.region,
           payload = excluded.payload,
           created_at = excluded.created_at,
           ttl_seconds = excluded.ttl_seconds,
           version = cache_entries.version + 1
         RETURNING version",
        params![
          key,
          CacheRegion::of_key(key).as_str(),
          data,
          now.timestamp_millis(),
          ttl_seconds
        ],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(CacheEntry {
      key: key.to_string(),
      payload: payload.clone(),
      created_at: now,
      ttl_seconds: ttl_seconds.map(|t| t as u64),
      version: version as u64,
    })
  }

  fn peek(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64, Option<i64>, i64)> = conn
      .query_row(
        "SELECT payload, created_at, ttl_seconds, version FROM cache_entries WHERE cache_key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let Some((data, created_at, ttl_seconds, version)) = row else {
      return Ok(None);
    };

    let payload: Value = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_at)
      .ok_or_else(|| eyre!("Invalid timestamp {} for cache entry {}", created_at, key))?;

    Ok(Some(CacheEntry {
      key: key.to_string(),
      payload,
      created_at,
      ttl_seconds: ttl_seconds.map(|t| t as u64),
      version: version as u64,
    }))
  }

  fn delete(&self, key: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries ORDER BY cache_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }

  fn count_expired(&self, now: DateTime<Utc>) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row(
        &format!("SELECT COUNT(*) FROM cache_entries WHERE {}", EXPIRED),
        params![now.timestamp_millis()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count expired entries: {}", e))?;
    Ok(count as usize)
  }

  fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
    self
      .lock()?
      .execute(
        &format!("DELETE FROM cache_entries WHERE {}", EXPIRED),
        params![now.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to sweep expired entries: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn backends() -> Vec<Box<dyn CacheStorage>> {
    vec![
      Box::new(MemoryStorage::new()),
      Box::new(SqliteStorage::open_in_memory().unwrap()),
    ]
  }

  #[test]
  fn test_round_trip_within_ttl() {
    for storage in backends() {
      let now = Utc::now();
      storage.put("k", &json!({"a": 1}), Some(60), now).unwrap();
      let entry = storage.get("k", now + Duration::seconds(30)).unwrap().unwrap();
      assert_eq!(entry.payload, json!({"a": 1}));
      assert_eq!(entry.version, 1);
    }
  }

  #[test]
  fn test_expired_entry_is_absent_and_evicted() {
    for storage in backends() {
      let now = Utc::now();
      storage.put("k", &json!("v"), Some(5), now).unwrap();
      let later = now + Duration::seconds(6);
      assert!(storage.get("k", later).unwrap().is_none());
      assert!(!storage.exists("k", later).unwrap());
      // Lazy eviction removed the row
      assert!(storage.peek("k").unwrap().is_none());
    }
  }

  #[test]
  fn test_overwrite_resets_age_and_bumps_version() {
    for storage in backends() {
      let now = Utc::now();
      storage.put("k", &json!(1), Some(10), now).unwrap();
      let rewritten = now + Duration::seconds(8);
      let entry = storage.put("k", &json!(2), Some(10), rewritten).unwrap();
      assert_eq!(entry.version, 2);

      // Would have expired under the first write's timestamp
      let entry = storage
        .get("k", now + Duration::seconds(15))
        .unwrap()
        .unwrap();
      assert_eq!(entry.payload, json!(2));
      assert_eq!(entry.version, 2);
    }
  }

  #[test]
  fn test_sweep_matches_expired_count() {
    for storage in backends() {
      let now = Utc::now();
      storage.put("a", &json!(1), Some(1), now).unwrap();
      storage.put("b", &json!(2), Some(1), now).unwrap();
      storage.put("c", &json!(3), None, now).unwrap();
      let later = now + Duration::seconds(2);
      assert_eq!(storage.count_expired(later).unwrap(), 2);
      assert_eq!(storage.sweep(later).unwrap(), 2);
      assert_eq!(storage.keys().unwrap(), vec!["c".to_string()]);
    }
  }

  #[test]
  fn test_delete_prefix_and_clear() {
    for storage in backends() {
      let now = Utc::now();
      storage.put("static:1", &json!(1), None, now).unwrap();
      storage.put("static:2", &json!(2), None, now).unwrap();
      storage.put("api:1", &json!(3), None, now).unwrap();
      assert_eq!(storage.delete_prefix("static:").unwrap(), 2);
      assert_eq!(storage.keys().unwrap(), vec!["api:1".to_string()]);
      storage.clear().unwrap();
      assert!(storage.keys().unwrap().is_empty());
    }
  }

  #[test]
  fn test_metadata_reports_expiry_without_evicting() {
    for storage in backends() {
      let now = Utc::now();
      storage.put("k", &json!(1), Some(1), now).unwrap();
      let meta = storage
        .metadata("k", now + Duration::seconds(5))
        .unwrap()
        .unwrap();
      assert!(meta.is_expired);
      assert!(storage.peek("k").unwrap().is_some());
    }
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let now = Utc::now();
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("user-1", &json!({"name": "Ada"}), None, now).unwrap();
    }
    let storage = SqliteStorage::open(&path).unwrap();
    let entry = storage.get("user-1", now).unwrap().unwrap();
    assert_eq!(entry.payload["name"], "Ada");
  }
}
