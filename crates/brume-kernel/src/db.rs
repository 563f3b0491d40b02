//! SQLite persistence for global and per-user storage.
//!
//! One key/value table. Global records are stored under their plain key;
//! encrypted user records are stored under a hashed, user-prefixed key so
//! both share the same file.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};

/// Database handle for background storage.
pub struct KvDb {
    conn: Connection,
}

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER DEFAULT (unixepoch())
);
"#;

impl KvDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn get(&self, key: &str) -> SqliteResult<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
    }

    /// Insert or replace a value.
    pub fn set(&self, key: &str, value: &str) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = unixepoch()",
            params![key, value],
        )?;
        Ok(())
    }

    /// Remove a key. Returns whether a row existed.
    pub fn delete(&self, key: &str) -> SqliteResult<bool> {
        let n = self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// All rows whose key starts with `prefix`, ordered by key.
    pub fn list_prefix(&self, prefix: &str) -> SqliteResult<Vec<KvRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value, updated_at FROM kv
             WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok(KvRecord { key: row.get(0)?, value: row.get(1)?, updated_at: row.get(2)? })
        })?;
        rows.collect()
    }
}
