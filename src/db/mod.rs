//! SQLite plumbing shared by the cache and queue stores.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// File name of the cache database inside the data directory.
pub const CACHE_DB: &str = "cache.db";
/// File name of the mutation queue database inside the data directory.
pub const QUEUE_DB: &str = "queue.db";

/// Open or create a database at `path` and apply `schema`.
pub fn open(path: &Path, schema: &str) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  migrate(&conn, schema)?;
  Ok(conn)
}

/// Open a private in-memory database and apply `schema`.
pub fn open_in_memory(schema: &str) -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
  migrate(&conn, schema)?;
  Ok(conn)
}

fn migrate(conn: &Connection, schema: &str) -> Result<()> {
  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))
}

/// Resolve the data directory, honouring an explicit override.
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
  if let Some(dir) = explicit {
    return Ok(dir.to_path_buf());
  }

  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offsync"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("x.db");
    let conn = open(&path, "CREATE TABLE IF NOT EXISTS t (a INTEGER);").unwrap();
    conn.execute("INSERT INTO t (a) VALUES (1)", []).unwrap();
    assert!(path.exists());
  }

  #[test]
  fn test_explicit_data_dir_wins() {
    let dir = data_dir(Some(Path::new("/tmp/offsync-test"))).unwrap();
    assert_eq!(dir, PathBuf::from("/tmp/offsync-test"));
  }
}
