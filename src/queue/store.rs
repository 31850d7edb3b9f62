//! SQLite-backed mutation queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, Params, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::types::{NewQueueItem, Operation, QueueItem};
use crate::{db, ids};

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
-- seq breaks ties between items enqueued in the same millisecond
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    operation TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT,
    enqueued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    target_url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(enqueued_at, seq);
CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_type ON sync_queue(entity_type);
CREATE INDEX IF NOT EXISTS idx_sync_queue_operation ON sync_queue(operation);
"#;

const COLUMNS: &str = "id, operation, entity_type, entity_id, payload, enqueued_at, \
                       retry_count, max_retries, target_url, method, headers";

/// Row as stored, before parsing the text columns.
struct RawItem {
  id: String,
  operation: String,
  entity_type: String,
  entity_id: String,
  payload: Option<String>,
  enqueued_at: i64,
  retry_count: u32,
  max_retries: u32,
  target_url: String,
  method: String,
  headers: String,
}

impl RawItem {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      operation: row.get(1)?,
      entity_type: row.get(2)?,
      entity_id: row.get(3)?,
      payload: row.get(4)?,
      enqueued_at: row.get(5)?,
      retry_count: row.get(6)?,
      max_retries: row.get(7)?,
      target_url: row.get(8)?,
      method: row.get(9)?,
      headers: row.get(10)?,
    })
  }

  fn parse(self) -> Result<QueueItem> {
    let payload: Option<Value> = self
      .payload
      .map(|p| serde_json::from_str(&p))
      .transpose()
      .map_err(|e| eyre!("Corrupt payload for queue item {}: {}", self.id, e))?;
    let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Corrupt headers for queue item {}: {}", self.id, e))?;
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Corrupt method for queue item {}: {}", self.id, e))?;
    let enqueued_at = DateTime::<Utc>::from_timestamp_millis(self.enqueued_at)
      .ok_or_else(|| eyre!("Corrupt timestamp for queue item {}", self.id))?;

    Ok(QueueItem {
      operation: self.operation.parse()?,
      id: self.id,
      entity_type: self.entity_type,
      entity_id: self.entity_id,
      payload,
      enqueued_at,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      target_url: self.target_url,
      method,
      headers,
    })
  }
}

/// Durable, ordered queue of pending writes.
pub struct MutationQueue {
  conn: Mutex<Connection>,
}

impl MutationQueue {
  /// Open (or create) the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn query<P: Params>(&self, filter: &str, params: P) -> Result<Vec<QueueItem>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM sync_queue {} ORDER BY enqueued_at, seq",
      COLUMNS, filter
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let raw = stmt
      .query_map(params, RawItem::from_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    raw.into_iter().map(RawItem::parse).collect()
  }

  /// Add an item, assigning its id, timestamp and a zero retry count.
  pub fn enqueue(&self, item: NewQueueItem) -> Result<QueueItem> {
    let queued = QueueItem {
      id: ids::generate("sync"),
      operation: item.operation,
      entity_type: item.entity_type,
      entity_id: item.entity_id,
      payload: item.payload,
      enqueued_at: Utc::now(),
      retry_count: 0,
      max_retries: item.max_retries,
      target_url: item.target_url,
      method: item.method,
      headers: item.headers,
    };

    let payload = queued
      .payload
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    let headers = serde_json::to_string(&queued.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT INTO sync_queue (id, operation, entity_type, entity_id, payload, enqueued_at,
                                 retry_count, max_retries, target_url, method, headers)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10)",
        params![
          queued.id,
          queued.operation.as_str(),
          queued.entity_type,
          queued.entity_id,
          payload,
          queued.enqueued_at.timestamp_millis(),
          queued.max_retries,
          queued.target_url,
          queued.method.as_str(),
          headers,
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue item: {}", e))?;

    tracing::info!(
      id = %queued.id,
      operation = queued.operation.as_str(),
      entity_type = %queued.entity_type,
      "Queued mutation"
    );
    Ok(queued)
  }

  pub fn enqueue_create(
    &self,
    entity_type: &str,
    entity_id: &str,
    payload: Value,
    url: &str,
  ) -> Result<QueueItem> {
    self.enqueue(NewQueueItem::new(
      Operation::Create,
      entity_type,
      entity_id,
      Some(payload),
      url,
    ))
  }

  pub fn enqueue_update(
    &self,
    entity_type: &str,
    entity_id: &str,
    payload: Value,
    url: &str,
  ) -> Result<QueueItem> {
    self.enqueue(NewQueueItem::new(
      Operation::Update,
      entity_type,
      entity_id,
      Some(payload),
      url,
    ))
  }

  pub fn enqueue_delete(&self, entity_type: &str, entity_id: &str, url: &str) -> Result<QueueItem> {
    self.enqueue(NewQueueItem::new(
      Operation::Delete,
      entity_type,
      entity_id,
      None,
      url,
    ))
  }

  /// Remove an item. Removing an unknown id succeeds.
  pub fn dequeue(&self, id: &str) -> Result<()> {
    let removed = self
      .lock()?
      .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
      .map_err(|e| eyre!("Failed to dequeue {}: {}", id, e))?;
    if removed > 0 {
      tracing::debug!(id, "Dequeued mutation");
    }
    Ok(())
  }

  /// Every item, oldest first.
  pub fn get_all(&self) -> Result<Vec<QueueItem>> {
    self.query("", [])
  }

  pub fn get_item(&self, id: &str) -> Result<Option<QueueItem>> {
    Ok(self.query("WHERE id = ?1", params![id])?.pop())
  }

  /// Bump the retry count, never past the item's budget.
  pub fn increment_retry_count(&self, id: &str) -> Result<Option<QueueItem>> {
    let updated = self
      .lock()?
      .execute(
        "UPDATE sync_queue SET retry_count = MIN(retry_count + 1, max_retries) WHERE id = ?1",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update retry count for {}: {}", id, e))?;

    if updated == 0 {
      return Ok(None);
    }
    self.get_item(id)
  }

  /// Items that still have retries left, oldest first.
  pub fn get_pending_items(&self) -> Result<Vec<QueueItem>> {
    self.query("WHERE retry_count < max_retries", [])
  }

  /// Items whose retry budget is exhausted, oldest first.
  pub fn get_failed_items(&self) -> Result<Vec<QueueItem>> {
    self.query("WHERE retry_count >= max_retries", [])
  }

  pub fn get_by_entity_type(&self, entity_type: &str) -> Result<Vec<QueueItem>> {
    self.query("WHERE entity_type = ?1", params![entity_type])
  }

  pub fn get_by_operation(&self, operation: Operation) -> Result<Vec<QueueItem>> {
    self.query("WHERE operation = ?1", params![operation.as_str()])
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn clear(&self) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM sync_queue", [])
      .map_err(|e| eyre!("Failed to clear queue: {}", e))?;
    tracing::info!("Cleared mutation queue");
    Ok(())
  }

  /// Purge terminally failed items. Returns how many were removed.
  pub fn remove_failed_items(&self) -> Result<usize> {
    let removed = self
      .lock()?
      .execute("DELETE FROM sync_queue WHERE retry_count >= max_retries", [])
      .map_err(|e| eyre!("Failed to remove failed items: {}", e))?;
    tracing::info!(removed, "Removed failed mutations");
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> MutationQueue {
    MutationQueue::open_in_memory().unwrap()
  }

  #[test]
  fn test_enqueue_assigns_id_and_zero_retries() {
    let q = queue();
    let item = q
      .enqueue_create("agent", "a1", json!({"name": "helper"}), "/api/agents")
      .unwrap();
    assert!(item.id.starts_with("sync_"));
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.method, Method::POST);

    let stored = q.get_item(&item.id).unwrap().unwrap();
    assert_eq!(stored, QueueItem {
      // Stored timestamps have millisecond precision
      enqueued_at: stored.enqueued_at,
      ..item
    });
  }

  #[test]
  fn test_get_all_preserves_enqueue_order_across_retries() {
    let q = queue();
    let ids: Vec<String> = (0..5)
      .map(|i| {
        q.enqueue_update("profile", &i.to_string(), json!({"n": i}), "/api/profile")
          .unwrap()
          .id
      })
      .collect();

    q.increment_retry_count(&ids[0]).unwrap();
    q.increment_retry_count(&ids[3]).unwrap();

    let order: Vec<String> = q.get_all().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(order, ids);
  }

  #[test]
  fn test_dequeue_is_idempotent() {
    let q = queue();
    let item = q.enqueue_delete("agent", "a1", "/api/agents/a1").unwrap();
    q.dequeue(&item.id).unwrap();
    q.dequeue(&item.id).unwrap();
    q.dequeue("never-existed").unwrap();
    assert!(q.is_empty().unwrap());
  }

  #[test]
  fn test_retry_exhaustion_moves_item_to_failed() {
    let q = queue();
    let item = q
      .enqueue(
        NewQueueItem::new(Operation::Create, "agent", "a1", Some(json!({})), "/api/agents")
          .with_max_retries(2),
      )
      .unwrap();
    let other = q.enqueue_delete("agent", "a2", "/api/agents/a2").unwrap();

    assert_eq!(q.increment_retry_count(&item.id).unwrap().unwrap().retry_count, 1);
    let exhausted = q.increment_retry_count(&item.id).unwrap().unwrap();
    assert_eq!(exhausted.retry_count, 2);
    assert!(exhausted.is_failed());

    // Capped at the budget
    assert_eq!(q.increment_retry_count(&item.id).unwrap().unwrap().retry_count, 2);

    let failed: Vec<String> = q.get_failed_items().unwrap().into_iter().map(|i| i.id).collect();
    let pending: Vec<String> = q.get_pending_items().unwrap().into_iter().map(|i| i.id).collect();
    assert_eq!(failed, vec![item.id.clone()]);
    assert_eq!(pending, vec![other.id]);

    assert!(q.increment_retry_count("missing").unwrap().is_none());
  }

  #[test]
  fn test_failed_items_are_kept_until_purged() {
    let q = queue();
    let item = q
      .enqueue(
        NewQueueItem::new(Operation::Update, "profile", "me", Some(json!({})), "/api/me")
          .with_max_retries(1),
      )
      .unwrap();
    q.increment_retry_count(&item.id).unwrap();
    assert_eq!(q.len().unwrap(), 1);

    assert_eq!(q.remove_failed_items().unwrap(), 1);
    assert!(q.is_empty().unwrap());
  }

  #[test]
  fn test_secondary_lookups() {
    let q = queue();
    q.enqueue_create("agent", "a1", json!({}), "/api/agents").unwrap();
    q.enqueue_update("profile", "me", json!({}), "/api/me").unwrap();
    q.enqueue_delete("agent", "a2", "/api/agents/a2").unwrap();

    assert_eq!(q.get_by_entity_type("agent").unwrap().len(), 2);
    let deletes = q.get_by_operation(Operation::Delete).unwrap();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].payload, None);

    q.clear().unwrap();
    assert_eq!(q.len().unwrap(), 0);
  }

  #[test]
  fn test_headers_and_payload_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let id = {
      let q = MutationQueue::open(&path).unwrap();
      q.enqueue(
        NewQueueItem::new(Operation::Update, "profile", "me", Some(json!({"a": [1, 2]})), "/api/me")
          .with_header("Authorization", "Bearer t")
          .with_method(Method::PATCH),
      )
      .unwrap()
      .id
    };

    let q = MutationQueue::open(&path).unwrap();
    let item = q.get_item(&id).unwrap().unwrap();
    assert_eq!(item.method, Method::PATCH);
    assert_eq!(item.headers["Authorization"], "Bearer t");
    assert_eq!(item.payload, Some(json!({"a": [1, 2]})));
  }
}
