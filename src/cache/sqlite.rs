//! SQLite-backed cache store (`cache` feature)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::store::{CacheKey, CacheStore, EntryKind, KeyScope, StoredEntry};
use crate::error::{GmailError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    account    TEXT NOT NULL,
    kind       TEXT NOT NULL,
    material   TEXT NOT NULL,
    value      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    ttl_secs   INTEGER NOT NULL,
    PRIMARY KEY (account, kind, material)
);";

/// Embedded store; statements are short so they run on the calling task
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GmailError::CacheError(format!("sqlite store lock poisoned: {}", e)))
    }
}

fn scope_params<'a>(scope: &KeyScope<'a>) -> (&'a str, Option<EntryKind>) {
    match scope {
        KeyScope::Account(account) => (*account, None),
        KeyScope::Kind(account, kind) => (*account, Some(*kind)),
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT value, created_at, ttl_secs FROM cache_entries
                 WHERE account = ?1 AND kind = ?2 AND material = ?3",
                params![key.account, key.kind.as_str(), key.material],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((value, created_at, ttl_secs)) = row else {
            return Ok(None);
        };
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| GmailError::CacheError(format!("bad created_at in cache: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(StoredEntry {
            value: serde_json::from_str(&value)?,
            created_at,
            ttl_secs: ttl_secs.max(0) as u64,
        }))
    }

    async fn set(&self, key: &CacheKey, entry: StoredEntry) -> Result<()> {
        let value = serde_json::to_string(&entry.value)?;
        self.lock()?.execute(
            "INSERT OR REPLACE INTO cache_entries
             (account, kind, material, value, created_at, ttl_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.account,
                key.kind.as_str(),
                key.material,
                value,
                entry.created_at.to_rfc3339(),
                entry.ttl_secs.min(i64::MAX as u64) as i64
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let removed = self.lock()?.execute(
            "DELETE FROM cache_entries WHERE account = ?1 AND kind = ?2 AND material = ?3",
            params![key.account, key.kind.as_str(), key.material],
        )?;
        Ok(removed > 0)
    }

    async fn delete_scope(&self, scope: KeyScope<'_>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = match scope_params(&scope) {
            (account, None) => {
                conn.execute("DELETE FROM cache_entries WHERE account = ?1", params![account])?
            }
            (account, Some(kind)) => conn.execute(
                "DELETE FROM cache_entries WHERE account = ?1 AND kind = ?2",
                params![account, kind.as_str()],
            )?,
        };
        Ok(removed)
    }

    async fn count(&self, scope: KeyScope<'_>) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = match scope_params(&scope) {
            (account, None) => conn.query_row(
                "SELECT COUNT(*) FROM cache_entries WHERE account = ?1",
                params![account],
                |row| row.get(0),
            )?,
            (account, Some(kind)) => conn.query_row(
                "SELECT COUNT(*) FROM cache_entries WHERE account = ?1 AND kind = ?2",
                params![account, kind.as_str()],
                |row| row.get(0),
            )?,
        };
        Ok(count.max(0) as usize)
    }
}
