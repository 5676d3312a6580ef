//! Cache storage trait and SQLite implementation.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::db::Database;
use crate::lifecycle::{Generation, GenerationState};
use crate::net::{Request, Response};

use super::traits::RequestKey;

/// A request identity paired with the response snapshot stored for it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub method: String,
  pub url: String,
  pub response: Response,
}

impl CacheEntry {
  pub fn new(request: &Request, response: Response) -> Self {
    Self {
      key: RequestKey::for_request(request),
      method: request.method.to_string(),
      url: request.url.to_string(),
      response,
    }
  }
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores, one per generation. Every write
/// replaces a whole entry.
pub trait CacheStorage: Send + Sync {
  /// Get the entry for a request identity in one store.
  fn get(&self, store: &Generation, key: &RequestKey) -> Result<Option<Response>>;

  /// Store a single entry, replacing any previous one.
  fn put(&self, store: &Generation, entry: &CacheEntry) -> Result<()>;

  /// Store a single entry only while `store` is the Active generation.
  ///
  /// The check and the write happen as one step, so a generation retired
  /// concurrently never gets entries back. Returns whether the entry landed.
  fn put_if_active(&self, store: &Generation, entry: &CacheEntry) -> Result<bool>;

  /// Store a batch of entries; either all land or none do.
  fn put_all(&self, store: &Generation, entries: &[CacheEntry]) -> Result<()>;

  /// URLs of every entry in one store.
  fn keys(&self, store: &Generation) -> Result<Vec<String>>;

  /// Number of entries in one store.
  fn count(&self, store: &Generation) -> Result<usize>;

  /// Names of every store holding at least one entry.
  fn names(&self) -> Result<Vec<Generation>>;

  /// Delete a whole store. Returns whether anything was removed.
  fn delete(&self, store: &Generation) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const UPSERT_ENTRY: &str = "INSERT OR REPLACE INTO cache_entries
   (cache_name, request_key, method, url, status, headers, body, stored_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))";

const UPSERT_ENTRY_IF_ACTIVE: &str = "INSERT OR REPLACE INTO cache_entries
   (cache_name, request_key, method, url, status, headers, body, stored_at)
   SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now')
   WHERE EXISTS (SELECT 1 FROM generations WHERE name = ?1 AND state = ?8)";

fn encode_headers(headers: &[(String, String)]) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

impl CacheStorage for SqliteStorage {
  fn get(&self, store: &Generation, key: &RequestKey) -> Result<Option<Response>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![store.as_str(), key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(Response {
          status,
          headers,
          body: Bytes::from(body),
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &Generation, entry: &CacheEntry) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = encode_headers(&entry.response.headers)?;

    conn
      .execute(
        UPSERT_ENTRY,
        params![
          store.as_str(),
          entry.key.as_str(),
          entry.method,
          entry.url,
          entry.response.status,
          headers,
          &entry.response.body[..],
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn put_if_active(&self, store: &Generation, entry: &CacheEntry) -> Result<bool> {
    let conn = self.db.conn()?;
    let headers = encode_headers(&entry.response.headers)?;

    let written = conn
      .execute(
        UPSERT_ENTRY_IF_ACTIVE,
        params![
          store.as_str(),
          entry.key.as_str(),
          entry.method,
          entry.url,
          entry.response.status,
          headers,
          &entry.response.body[..],
          GenerationState::Active.as_str(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(written > 0)
  }

  fn put_all(&self, store: &Generation, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.db.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entry in entries {
      let headers = encode_headers(&entry.response.headers)?;
      tx.execute(
        UPSERT_ENTRY,
        params![
          store.as_str(),
          entry.key.as_str(),
          entry.method,
          entry.url,
          entry.response.status,
          headers,
          &entry.response.body[..],
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.url, e))?;
    }

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, store: &Generation) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![store.as_str()], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache entry url: {}", e))?;

    Ok(urls)
  }

  fn count(&self, store: &Generation) -> Result<usize> {
    let conn = self.db.conn()?;

    let count = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![store.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(count)
  }

  fn names(&self) -> Result<Vec<Generation>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names.into_iter().map(Generation::new).collect())
  }

  fn delete(&self, store: &Generation) -> Result<bool> {
    let conn = self.db.conn()?;

    // Single statement, so a store is either fully present or fully gone
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![store.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete store {}: {}", store, e))?;

    Ok(removed > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  fn entry(path: &str, body: &str) -> CacheEntry {
    CacheEntry::new(
      &request(path),
      Response::new(
        200,
        vec![("Content-Type".to_string(), "text/plain".to_string())],
        body.to_string(),
      ),
    )
  }

  #[test]
  fn test_put_then_get_preserves_snapshot() {
    let storage = storage();
    let shell = Generation::new("shell-v1");
    let e = entry("/manifest.json", "{}");

    storage.put(&shell, &e).unwrap();

    let cached = storage.get(&shell, &e.key).unwrap().unwrap();
    assert_eq!(cached, e.response);
  }

  #[test]
  fn test_last_writer_wins() {
    let storage = storage();
    let shell = Generation::new("shell-v1");

    storage.put(&shell, &entry("/app.js", "one")).unwrap();
    storage.put(&shell, &entry("/app.js", "two")).unwrap();

    let key = RequestKey::for_request(&request("/app.js"));
    assert_eq!(&storage.get(&shell, &key).unwrap().unwrap().body[..], b"two");
    assert_eq!(storage.count(&shell).unwrap(), 1);
  }

  #[test]
  fn test_stores_are_isolated() {
    let storage = storage();
    let v1 = Generation::new("shell-v1");
    let v2 = Generation::new("shell-v2");
    let e = entry("/", "index");

    storage.put(&v1, &e).unwrap();

    assert!(storage.get(&v2, &e.key).unwrap().is_none());
    assert_eq!(storage.names().unwrap(), vec![v1]);
  }

  #[test]
  fn test_delete_removes_whole_store_only() {
    let storage = storage();
    let v1 = Generation::new("shell-v1");
    let v2 = Generation::new("shell-v2");

    storage
      .put_all(&v1, &[entry("/", "a"), entry("/favicon.png", "b")])
      .unwrap();
    storage.put(&v2, &entry("/", "c")).unwrap();

    assert!(storage.delete(&v1).unwrap());
    assert!(!storage.delete(&v1).unwrap());
    assert_eq!(storage.count(&v1).unwrap(), 0);
    assert_eq!(storage.count(&v2).unwrap(), 1);
    assert_eq!(storage.names().unwrap(), vec![v2]);
  }

  fn register(storage: &SqliteStorage, name: &str, state: GenerationState) {
    storage
      .db
      .conn()
      .unwrap()
      .execute(
        "INSERT INTO generations (name, state, fingerprint) VALUES (?, ?, '')",
        params![name, state.as_str()],
      )
      .unwrap();
  }

  #[test]
  fn test_put_if_active_only_writes_active_generation() {
    let storage = storage();
    let active = Generation::new("shell-v2");
    let retired = Generation::new("shell-v1");
    register(&storage, "shell-v2", GenerationState::Active);
    register(&storage, "shell-v1", GenerationState::Retired);

    assert!(storage.put_if_active(&active, &entry("/x.png", "new")).unwrap());
    assert!(!storage.put_if_active(&retired, &entry("/x.png", "late")).unwrap());
    assert!(!storage
      .put_if_active(&Generation::new("unknown"), &entry("/x.png", "late"))
      .unwrap());

    assert_eq!(storage.count(&active).unwrap(), 1);
    assert_eq!(storage.names().unwrap(), vec![active]);
  }

  #[test]
  fn test_keys_lists_urls() {
    let storage = storage();
    let shell = Generation::new("shell-v1");
    storage
      .put_all(&shell, &[entry("/manifest.json", "{}"), entry("/", "index")])
      .unwrap();

    assert_eq!(
      storage.keys(&shell).unwrap(),
      vec![
        "https://app.test/".to_string(),
        "https://app.test/manifest.json".to_string()
      ]
    );
  }
}
