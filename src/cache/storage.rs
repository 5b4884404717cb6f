//! Bucket storage trait with in-memory and SQLite implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::traits::{RequestKey, StoredResponse};
use crate::error::{CacheError, Result};

/// Trait for bucket storage backends.
///
/// Every operation may suspend. Writes to the same key are last-write-wins.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Names of every bucket, sorted.
  async fn bucket_names(&self) -> Result<Vec<String>>;

  async fn has_bucket(&self, name: &str) -> Result<bool>;

  /// Create the bucket if it does not exist yet.
  async fn open_bucket(&self, name: &str) -> Result<()>;

  /// Delete a bucket and all its entries. Returns whether it existed.
  async fn delete_bucket(&self, name: &str) -> Result<bool>;

  /// Look up a stored response. A missing bucket is a miss.
  async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store a response, creating the bucket if needed.
  async fn put(&self, bucket: &str, key: &RequestKey, response: &StoredResponse) -> Result<()>;

  /// Store several responses; either all land or none do.
  async fn put_batch(&self, bucket: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()>;

  async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool>;

  /// Keys held in a bucket, sorted.
  async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

type Bucket = BTreeMap<RequestKey, StoredResponse>;

/// Process-local storage. Used by tests and by `storage.kind: memory`.
#[derive(Default)]
pub struct MemoryStorage {
  buckets: RwLock<BTreeMap<String, Bucket>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
  async fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(self.buckets.read().await.keys().cloned().collect())
  }

  async fn has_bucket(&self, name: &str) -> Result<bool> {
    Ok(self.buckets.read().await.contains_key(name))
  }

  async fn open_bucket(&self, name: &str) -> Result<()> {
    self
      .buckets
      .write()
      .await
      .entry(name.to_string())
      .or_default();
    Ok(())
  }

  async fn delete_bucket(&self, name: &str) -> Result<bool> {
    Ok(self.buckets.write().await.remove(name).is_some())
  }

  async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .buckets
        .read()
        .await
        .get(bucket)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  async fn put(&self, bucket: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let mut stored = response.clone();
    stored.cached_at = Some(Utc::now());
    self
      .buckets
      .write()
      .await
      .entry(bucket.to_string())
      .or_default()
      .insert(key.clone(), stored);
    Ok(())
  }

  async fn put_batch(&self, bucket: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let now = Utc::now();
    let mut buckets = self.buckets.write().await;
    let target = buckets.entry(bucket.to_string()).or_default();
    for (key, response) in entries {
      let mut stored = response.clone();
      stored.cached_at = Some(now);
      target.insert(key.clone(), stored);
    }
    Ok(())
  }

  async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
    Ok(
      self
        .buckets
        .write()
        .await
        .get_mut(bucket)
        .map(|entries| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    Ok(
      self
        .buckets
        .read()
        .await
        .get(bucket)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based bucket storage.
///
/// Queries run on the blocking pool so request handlers suspend rather than
/// stall the runtime.
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open storage at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      CacheError::storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let storage = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::storage("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| CacheError::storage(format!("Lock poisoned: {}", e)))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(())
  }

  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn
        .lock()
        .map_err(|e| CacheError::storage(format!("Lock poisoned: {}", e)))?;
      f(&mut conn)
    })
    .await
    .map_err(|e| CacheError::storage(format!("Storage task failed: {}", e)))?
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per stored response; key_hash is SHA256 of request_key
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, key_hash),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

fn insert_entry(
  conn: &Connection,
  bucket: &str,
  key: &RequestKey,
  response: &StoredResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| CacheError::storage(format!("Failed to serialize headers: {}", e)))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| CacheError::storage(format!("Failed to create bucket: {}", e)))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (bucket, key_hash, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        key.cache_hash(),
        key.as_str(),
        response.status,
        headers,
        response.body.as_ref()
      ],
    )
    .map_err(|e| CacheError::storage(format!("Failed to store entry: {}", e)))?;

  Ok(())
}

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn bucket_names(&self) -> Result<Vec<String>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM buckets ORDER BY name")?;
        let names = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
      })
      .await
  }

  async fn has_bucket(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self
      .with_conn(move |conn| {
        let found: Option<i64> = conn
          .query_row(
            "SELECT 1 FROM buckets WHERE name = ?",
            params![name],
            |row| row.get(0),
          )
          .optional()?;
        Ok(found.is_some())
      })
      .await
  }

  async fn open_bucket(&self, name: &str) -> Result<()> {
    let name = name.to_string();
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
          params![name],
        )?;
        Ok(())
      })
      .await
  }

  async fn delete_bucket(&self, name: &str) -> Result<bool> {
    let name = name.to_string();
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entries WHERE bucket = ?", params![name])?;
        let removed = tx.execute("DELETE FROM buckets WHERE name = ?", params![name])?;
        tx.commit()?;
        Ok(removed > 0)
      })
      .await
  }

  async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let bucket = bucket.to_string();
    let key_hash = key.cache_hash();
    self
      .with_conn(move |conn| {
        let row: Option<(u16, String, Vec<u8>, String)> = conn
          .query_row(
            "SELECT status, headers, body, cached_at FROM entries
             WHERE bucket = ? AND key_hash = ?",
            params![bucket, key_hash],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
          )
          .optional()?;

        match row {
          Some((status, headers, body, cached_at)) => {
            let headers: Vec<(String, String)> = serde_json::from_str(&headers)
              .map_err(|e| CacheError::storage(format!("Failed to parse stored headers: {}", e)))?;
            Ok(Some(StoredResponse {
              status,
              headers,
              body: body.into(),
              cached_at: Some(parse_datetime(&cached_at)?),
            }))
          }
          None => Ok(None),
        }
      })
      .await
  }

  async fn put(&self, bucket: &str, key: &RequestKey, response: &StoredResponse) -> Result<()> {
    let bucket = bucket.to_string();
    let key = key.clone();
    let response = response.clone();
    self
      .with_conn(move |conn| insert_entry(conn, &bucket, &key, &response))
      .await
  }

  async fn put_batch(&self, bucket: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let bucket = bucket.to_string();
    let entries = entries.to_vec();
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        for (key, response) in &entries {
          insert_entry(&tx, &bucket, key, response)?;
        }
        tx.commit()?;
        Ok(())
      })
      .await
  }

  async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
    let bucket = bucket.to_string();
    let key_hash = key.cache_hash();
    self
      .with_conn(move |conn| {
        let removed = conn.execute(
          "DELETE FROM entries WHERE bucket = ? AND key_hash = ?",
          params![bucket, key_hash],
        )?;
        Ok(removed > 0)
      })
      .await
  }

  async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let bucket = bucket.to_string();
    self
      .with_conn(move |conn| {
        let mut stmt =
          conn.prepare("SELECT request_key FROM entries WHERE bucket = ? ORDER BY request_key")?;
        let keys = stmt
          .query_map(params![bucket], |row| row.get::<_, String>(0))?
          .map(|r| r.map(RequestKey::from_raw))
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
      })
      .await
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| CacheError::storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(path: &str) -> RequestKey {
    RequestKey::from_raw(format!("GET http://localhost{}", path))
  }

  async fn exercise_round_trip<S: CacheStorage>(storage: &S) {
    let response = StoredResponse::new(
      200,
      vec![("content-type".into(), "text/css".into())],
      "body { color: black }",
    );
    storage.put("timetable-v1", &key("/styles.css"), &response).await.unwrap();

    let stored = storage
      .get("timetable-v1", &key("/styles.css"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.status, 200);
    assert_eq!(stored.body, response.body);
    assert_eq!(stored.header("content-type"), Some("text/css"));
    assert!(stored.cached_at.is_some());
  }

  async fn exercise_buckets<S: CacheStorage>(storage: &S) {
    storage.open_bucket("timetable-v1").await.unwrap();
    storage.open_bucket("timetable-v2").await.unwrap();
    storage
      .put("timetable-v2", &key("/"), &StoredResponse::html("<p>v2</p>"))
      .await
      .unwrap();

    assert_eq!(
      storage.bucket_names().await.unwrap(),
      vec!["timetable-v1".to_string(), "timetable-v2".to_string()]
    );
    assert!(storage.delete_bucket("timetable-v2").await.unwrap());
    assert!(!storage.delete_bucket("timetable-v2").await.unwrap());
    assert!(!storage.has_bucket("timetable-v2").await.unwrap());
    assert!(storage.get("timetable-v2", &key("/")).await.unwrap().is_none());
  }

  async fn exercise_overwrite_and_keys<S: CacheStorage>(storage: &S) {
    storage
      .put_batch(
        "b",
        &[
          (key("/index.html"), StoredResponse::html("old")),
          (key("/app.js"), StoredResponse::new(200, vec![], "js")),
        ],
      )
      .await
      .unwrap();
    storage
      .put("b", &key("/index.html"), &StoredResponse::html("new"))
      .await
      .unwrap();

    let stored = storage.get("b", &key("/index.html")).await.unwrap().unwrap();
    assert_eq!(stored.body.as_ref(), b"new");
    assert_eq!(
      storage.keys("b").await.unwrap(),
      vec![key("/app.js"), key("/index.html")]
    );
    assert!(storage.delete("b", &key("/app.js")).await.unwrap());
    assert_eq!(storage.keys("b").await.unwrap(), vec![key("/index.html")]);
  }

  #[tokio::test]
  async fn test_memory_round_trip() {
    exercise_round_trip(&MemoryStorage::new()).await;
  }

  #[tokio::test]
  async fn test_memory_buckets() {
    exercise_buckets(&MemoryStorage::new()).await;
  }

  #[tokio::test]
  async fn test_memory_overwrite_and_keys() {
    exercise_overwrite_and_keys(&MemoryStorage::new()).await;
  }

  #[tokio::test]
  async fn test_sqlite_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(Some(&dir.path().join("cache.db"))).unwrap();
    exercise_round_trip(&storage).await;
  }

  #[tokio::test]
  async fn test_sqlite_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(Some(&dir.path().join("cache.db"))).unwrap();
    exercise_buckets(&storage).await;
  }

  #[tokio::test]
  async fn test_sqlite_overwrite_and_keys() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(Some(&dir.path().join("cache.db"))).unwrap();
    exercise_overwrite_and_keys(&storage).await;
  }

  #[tokio::test]
  async fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      storage
        .put("timetable-v3", &key("/offline.html"), &StoredResponse::html("offline"))
        .await
        .unwrap();
    }

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    assert!(storage.has_bucket("timetable-v3").await.unwrap());
    let stored = storage
      .get("timetable-v3", &key("/offline.html"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.body.as_ref(), b"offline");
  }
}
