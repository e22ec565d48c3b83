//! Persistent mirror trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::CacheEntry;

/// A cache entry as it is written to the persistent store.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
  pub tags: Vec<String>,
}

impl From<&CacheEntry> for PersistedEntry {
  fn from(entry: &CacheEntry) -> Self {
    Self {
      key: entry.key.clone(),
      value: entry.value.clone(),
      stored_at: entry.stored_at,
      ttl: entry.ttl,
      tags: entry.tags.iter().cloned().collect(),
    }
  }
}

impl From<PersistedEntry> for CacheEntry {
  fn from(entry: PersistedEntry) -> Self {
    Self {
      key: entry.key,
      value: entry.value,
      stored_at: entry.stored_at,
      ttl: entry.ttl,
      tags: entry.tags.into_iter().collect(),
    }
  }
}

/// Trait for persistent cache backends.
///
/// Calls are blocking; the cache store runs them off the async executor.
pub trait PersistentStore: Send + Sync {
  /// Insert or replace one entry.
  fn put(&self, entry: &PersistedEntry) -> Result<()>;

  /// Remove entries by key. Unknown keys are ignored.
  fn remove(&self, keys: &[String]) -> Result<()>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;

  /// Read every persisted entry, expired or not.
  fn load_all(&self) -> Result<Vec<PersistedEntry>>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl PersistentStore for NoopStorage {
  fn put(&self, _entry: &PersistedEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _keys: &[String]) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn load_all(&self) -> Result<Vec<PersistedEntry>> {
    Ok(Vec::new()) // Nothing to warm from
  }
}

/// SQLite-based persistent store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
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

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("feedcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]'
);
"#;

impl PersistentStore for SqliteStorage {
  fn put(&self, entry: &PersistedEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let value =
      serde_json::to_vec(&entry.value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;
    let tags =
      serde_json::to_string(&entry.tags).map_err(|e| eyre!("Failed to serialize tags: {}", e))?;
    let ttl_ms = i64::try_from(entry.ttl.as_millis()).unwrap_or(i64::MAX);

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, value, stored_at, ttl_ms, tags)
         VALUES (?, ?, ?, ?, ?)",
        params![entry.key, value, entry.stored_at.to_rfc3339(), ttl_ms, tags],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key, e))?;

    Ok(())
  }

  fn remove(&self, keys: &[String]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    {
      let mut stmt = tx
        .prepare("DELETE FROM cache_entries WHERE key = ?")
        .map_err(|e| eyre!("Failed to prepare delete: {}", e))?;
      for key in keys {
        stmt
          .execute(params![key])
          .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
      }
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }

  fn load_all(&self) -> Result<Vec<PersistedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key, value, stored_at, ttl_ms, tags FROM cache_entries")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, String, i64, String)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    // Rows that no longer decode are skipped rather than failing the warm start
    let entries = rows
      .into_iter()
      .filter_map(|(key, value, stored_at, ttl_ms, tags)| {
        let value = serde_json::from_slice(&value).ok()?;
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
          .ok()?
          .with_timezone(&Utc);
        let tags = serde_json::from_str(&tags).ok()?;
        Some(PersistedEntry {
          key,
          value,
          stored_at,
          ttl: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
          tags,
        })
      })
      .collect();

    Ok(entries)
  }
}
