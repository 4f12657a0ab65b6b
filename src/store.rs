// Key-value storage backends with per-entry expiry
// Plays the role of a cookie jar: entries can carry an absolute expiry and
// read back as absent once it has passed.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rusqlite::OptionalExtension;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Storage contract used by the credential store
pub trait KeyValueStore: Send + Sync {
    /// Read a live entry; expired entries read as `None`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write an entry, replacing any previous value
    fn set(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Delete an entry; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Process-local store backed by a concurrent map
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expiry recorded for a key, if any
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).and_then(|entry| entry.expires_at)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }

        // Re-checked under the shard lock so a concurrent `set` survives
        if self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(now))
            .is_some()
        {
            tracing::debug!(key, "Dropping expired entry");
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Persistent store in a SQLite `auth_kv` table
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Throwaway database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM auth_kv WHERE key = ?",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("Failed to read {} from SQLite", key))?;

        let Some((value, expires_at)) = row else {
            return Ok(None);
        };

        let expired = expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .is_some_and(|exp| Utc::now() >= exp);

        if expired {
            tracing::debug!(key, "Purging expired entry");
            conn.execute("DELETE FROM auth_kv WHERE key = ?", [key])
                .with_context(|| format!("Failed to purge expired {}", key))?;
            return Ok(None);
        }

        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO auth_kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at.map(|exp| exp.timestamp())],
        )
        .with_context(|| format!("Failed to write {} to SQLite", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [key])
            .with_context(|| format!("Failed to delete {} from SQLite", key))?;
        Ok(())
    }
}
