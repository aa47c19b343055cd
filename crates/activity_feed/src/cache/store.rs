//! SQLite persistence for interval lists, one row per cache key.

use crate::cache::Interval;
use crate::model::CacheKey;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stored row summary for inspection.
#[derive(Clone, Debug)]
pub struct StoredKey {
    pub label: String,
    pub interval_count: usize,
    pub activity_count: usize,
    pub updated_utc: i64,
}

/// Durable key-value store backing the interval cache. Key = SHA-256 of the readable key.
pub struct IntervalStore {
    conn: Mutex<Connection>,
}

impl IntervalStore {
    /// Open or create the store at `path`. Creates parent dirs if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS intervals (
                key TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_utc INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_intervals_label ON intervals(label);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Content-hash row key for a cache key.
    pub fn key_for(key: &CacheKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))
    }

    /// Load the interval list for `key`. Returns None if missing.
    pub fn load(&self, key: &CacheKey) -> Result<Option<Vec<Interval>>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM intervals WHERE key = ?1")?;
        let row = stmt
            .query_row([Self::key_for(key)], |r| r.get::<_, Vec<u8>>(0))
            .optional()?;
        match row {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace the interval list for `key`.
    pub fn save(&self, key: &CacheKey, intervals: &[Interval]) -> Result<(), StoreError> {
        let value = serde_json::to_vec(intervals)?;
        let updated = time::OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO intervals (key, label, value, updated_utc) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![Self::key_for(key), key.to_string(), value, updated],
        )?;
        Ok(())
    }

    pub fn clear_key(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM intervals WHERE key = ?1", [Self::key_for(key)])?;
        Ok(n > 0)
    }

    /// Drop every row whose label starts with `prefix` (all rows when empty).
    pub fn clear_matching(&self, prefix: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let n = conn.execute(
            "DELETE FROM intervals WHERE label LIKE ?1 ESCAPE '\\'",
            [pattern],
        )?;
        Ok(n)
    }

    pub fn list(&self) -> Result<Vec<StoredKey>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT label, value, updated_utc FROM intervals ORDER BY label")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Vec<u8>>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (label, value, updated_utc) = row?;
            let intervals: Vec<Interval> = serde_json::from_slice(&value)?;
            out.push(StoredKey {
                label,
                interval_count: intervals.len(),
                activity_count: intervals.iter().map(|i| i.activities.len()).sum(),
                updated_utc,
            });
        }
        Ok(out)
    }
}
