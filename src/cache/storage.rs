//! SQLite implementation of the tier, TTL and durable stores.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{DurableStore, TierStore, TtlStore};
use crate::net::Response;

/// SQLite-based storage for cache tiers, the TTL index and the offline queues.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("offsync.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for storage tables.
const SCHEMA: &str = r#"
-- Cached responses, one row per (tier, key). `seq` tracks insertion order.
CREATE TABLE IF NOT EXISTS cache_entries (
    tier TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    seq INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (tier, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_seq ON cache_entries(tier, seq);

-- Insertion time per API response
CREATE TABLE IF NOT EXISTS ttl_index (
    url TEXT PRIMARY KEY,
    stored_at TEXT NOT NULL
);

-- Serialized queues and other engine state
CREATE TABLE IF NOT EXISTS durable_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl TierStore for SqliteStorage {
  fn get(&self, tier: &str, key: &str) -> Result<Option<Response>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries WHERE tier = ? AND cache_key = ?",
        params![tier, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (tier, cache_key, status, headers, body, seq, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries WHERE tier = ?1),
                 datetime('now'))",
        params![tier, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE tier = ? AND cache_key = ?",
        params![tier, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries WHERE tier = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![tier], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn tier_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT tier FROM cache_entries ORDER BY tier")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list tiers: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute("DELETE FROM cache_entries WHERE tier = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete tier {}: {}", tier, e))?;

    Ok(removed > 0)
  }
}

impl TtlStore for SqliteStorage {
  fn stamp(&self, url: &str, stored_at: DateTime<Utc>) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO ttl_index (url, stored_at) VALUES (?, ?)",
        params![url, stored_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to write TTL record: {}", e))?;

    Ok(())
  }

  fn stored_at(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
    let stored: Option<String> = self
      .conn()?
      .query_row(
        "SELECT stored_at FROM ttl_index WHERE url = ?",
        params![url],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read TTL record: {}", e))?;

    stored.as_deref().map(parse_datetime).transpose()
  }

  fn unstamp(&self, url: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM ttl_index WHERE url = ?", params![url])
      .map_err(|e| eyre!("Failed to delete TTL record: {}", e))?;

    Ok(())
  }

  fn stamps(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT url, stored_at FROM ttl_index")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to read TTL index: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    // Unparseable timestamps are skipped; a missing record reads as expired.
    Ok(
      rows
        .into_iter()
        .filter_map(|(url, at)| parse_datetime(&at).ok().map(|at| (url, at)))
        .collect(),
    )
  }

  fn clear_stamps(&self) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM ttl_index", [])
      .map_err(|e| eyre!("Failed to clear TTL index: {}", e))?;

    Ok(())
  }
}

impl DurableStore for SqliteStorage {
  fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM durable_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load {}: {}", key, e))
  }

  fn save(&self, key: &str, value: &[u8]) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO durable_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to save {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM durable_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;

    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by [`TtlStore::stamp`].
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
