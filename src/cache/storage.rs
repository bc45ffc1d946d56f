//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::CachedEntry;
use crate::http::Response;

/// Trait for cache storage backends.
///
/// Buckets are independent named partitions; the same key may exist in more
/// than one bucket without interference.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open_bucket(&self, bucket: &str) -> Result<()>;

  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket and every entry in it. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// Store a response, overwriting any entry with the same key.
  fn put(&self, bucket: &str, key: &str, url: &str, response: &Response) -> Result<()>;

  /// Store several responses atomically: either all are written or none.
  fn put_all(&self, bucket: &str, entries: &[(String, String, Response)]) -> Result<()>;

  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Look a key up across every bucket, oldest bucket first.
  fn match_any(&self, key: &str) -> Result<Option<CachedEntry>>;

  /// URLs stored in a bucket.
  fn keys(&self, bucket: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    response BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (bucket, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(request_key);
"#;

fn insert_entry(
  conn: &Connection,
  bucket: &str,
  key: &str,
  url: &str,
  response: &Response,
) -> Result<()> {
  let data =
    serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (bucket, request_key, url, response, stored_at)
       VALUES (?, ?, ?, ?, ?)",
      params![bucket, key, url, data, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", url, bucket, e))?;

  Ok(())
}

fn decode_entry(url: String, data: Vec<u8>, stored_at: String) -> Result<CachedEntry> {
  let response: Response =
    serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize response: {}", e))?;
  let stored_at = DateTime::parse_from_rfc3339(&stored_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", stored_at, e))?;

  Ok(CachedEntry {
    url,
    response,
    stored_at,
  })
}

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, bucket: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
    Ok(())
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, bucket: &str, key: &str, url: &str, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, bucket, key, url, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(String, String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, url, response) in entries {
      insert_entry(&tx, bucket, key, url, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<(String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, response, stored_at FROM entries WHERE bucket = ? AND request_key = ?",
        params![bucket, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row
      .map(|(url, data, stored_at)| decode_entry(url, data, stored_at))
      .transpose()
  }

  fn match_any(&self, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<(String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT e.url, e.response, e.stored_at FROM entries e
         INNER JOIN buckets b ON b.name = e.bucket
         WHERE e.request_key = ?
         ORDER BY b.created_at, b.name
         LIMIT 1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row
      .map(|(url, data, stored_at)| decode_entry(url, data, stored_at))
      .transpose()
  }

  fn keys(&self, bucket: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE bucket = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  #[test]
  fn test_put_overwrites_same_key() {
    let storage = storage();
    storage
      .put("b", "k", "/a", &Response::new(200, "one"))
      .unwrap();
    storage
      .put("b", "k", "/a", &Response::new(200, "two"))
      .unwrap();

    assert_eq!(storage.keys("b").unwrap(), vec!["/a".to_string()]);
    let entry = storage.get("b", "k").unwrap().unwrap();
    assert_eq!(entry.response.body_text(), "two");
  }

  #[test]
  fn test_buckets_do_not_mix() {
    let storage = storage();
    storage
      .put("static", "k", "/a", &Response::new(200, "s"))
      .unwrap();
    assert!(storage.get("dynamic", "k").unwrap().is_none());
    assert_eq!(storage.bucket_names().unwrap(), vec!["static".to_string()]);
  }

  #[test]
  fn test_delete_bucket_removes_entries() {
    let storage = storage();
    storage.open_bucket("old").unwrap();
    storage
      .put("old", "k", "/a", &Response::new(200, "x"))
      .unwrap();

    assert!(storage.delete_bucket("old").unwrap());
    assert!(!storage.delete_bucket("old").unwrap());
    assert!(storage.get("old", "k").unwrap().is_none());
    assert!(storage.bucket_names().unwrap().is_empty());
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    let storage = storage();
    let entries = vec![
      ("k1".to_string(), "/a".to_string(), Response::new(200, "a")),
      ("k2".to_string(), "/b".to_string(), Response::new(200, "b")),
    ];
    storage.put_all("static", &entries).unwrap();
    storage.put_all("static", &entries).unwrap();
    assert_eq!(storage.keys("static").unwrap().len(), 2);
  }

  #[test]
  fn test_match_any_searches_all_buckets() {
    let storage = storage();
    storage.open_bucket("a").unwrap();
    storage
      .put("b", "offline", "/offline.html", &Response::html(200, "offline"))
      .unwrap();

    let entry = storage.match_any("offline").unwrap().unwrap();
    assert_eq!(entry.url, "/offline.html");
    assert!(storage.match_any("missing").unwrap().is_none());
  }
}
