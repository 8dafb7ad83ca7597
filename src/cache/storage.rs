//! SQLite implementation of the cache bucket store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{
  check_storable, vary_matches, varied_headers, BucketSummary, CacheStorage, CachedEntry,
};
use crate::net::{Request, Response};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
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

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache bucket, named by version
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached request/response pairs, keyed by URL within a bucket
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    request_headers TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_url TEXT,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, url),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);
"#;

/// Insert one entry into an existing bucket. The caller owns the transaction.
fn insert_entry(
  conn: &Connection,
  bucket: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  check_storable(request, response)?;

  let request_headers = encode_headers(&varied_headers(request, response))?;
  let headers = encode_headers(&response.headers)?;
  let response_url = response.url.as_ref().map(Url::as_str);

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (bucket, url, method, request_headers, status, response_url, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        request.cache_url(),
        request.method.as_str(),
        request_headers,
        response.status.as_u16(),
        response_url,
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry for {}: {}", request.url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;

    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open cache bucket {}: {}", bucket, e))?;

    Ok(inserted > 0)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache bucket name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;

    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete cache bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, bucket: &str, request: &Request) -> Result<Option<CachedEntry>> {
    // Only GET requests are ever stored
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT request_headers, status, response_url, headers, body, cached_at FROM entries
         WHERE bucket = ? AND url = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, Option<String>, String, Vec<u8>, String)> = stmt
      .query_row(params![bucket, request.cache_url()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    let Some((request_headers, status, response_url, headers, body, cached_at_str)) = row else {
      return Ok(None);
    };

    let response = Response {
      status: StatusCode::from_u16(status)
        .map_err(|e| eyre!("Invalid cached status {}: {}", status, e))?,
      url: response_url.and_then(|u| Url::parse(&u).ok()),
      headers: decode_headers(&headers)?,
      body: body.into(),
    };

    if !vary_matches(&decode_headers(&request_headers)?, &response, request) {
      return Ok(None);
    }

    Ok(Some(CachedEntry {
      response,
      cached_at: parse_datetime(&cached_at_str)?,
    }))
  }

  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<bool> {
    let conn = self.lock()?;

    let exists = conn
      .query_row(
        "SELECT 1 FROM buckets WHERE name = ?",
        params![bucket],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache bucket {}: {}", bucket, e))?
      .is_some();

    if !exists {
      return Ok(false);
    }

    insert_entry(&conn, bucket, request, response)?;
    Ok(true)
  }

  fn put_all(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to create cache bucket {}: {}", bucket, e))?;

    for (request, response) in entries {
      insert_entry(&tx, bucket, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_urls(&self, bucket: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE bucket = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cached URL: {}", e))?;

    Ok(urls)
  }

  fn summaries(&self) -> Result<Vec<BucketSummary>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT b.name, COUNT(e.url) FROM buckets b
         LEFT JOIN entries e ON e.bucket = b.name
         GROUP BY b.name
         ORDER BY b.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let summaries = stmt
      .query_map([], |row| {
        Ok(BucketSummary {
          name: row.get(0)?,
          entries: row.get::<_, i64>(1)? as usize,
        })
      })
      .map_err(|e| eyre!("Failed to summarize cache buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache bucket summary: {}", e))?;

    Ok(summaries)
  }
}

/// Serialize headers as a JSON list of `[name, value]` pairs.
fn encode_headers(headers: &HeaderMap) -> Result<String> {
  let pairs: Vec<(&str, String)> = headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect();

  serde_json::to_string(&pairs).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(json: &str) -> Result<HeaderMap> {
  let pairs: Vec<(String, String)> =
    serde_json::from_str(json).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  let mut headers = HeaderMap::with_capacity(pairs.len());
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(&value),
    ) {
      headers.append(name, value);
    }
  }

  Ok(headers)
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
