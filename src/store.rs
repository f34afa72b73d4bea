//! Durable update log backing one listener's engine instance.
//!
//! The log is append-only at runtime. On startup the owning engine replays
//! every row into a fresh document, then compacts the history down to a
//! single merged row. SQLite access is serialized behind a mutex; all
//! operations are short synchronous statements.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use crate::error::Result;

const SCHEMA_DDL: &str = "
    CREATE TABLE IF NOT EXISTS updates (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        payload BLOB NOT NULL
    );
";

pub struct UpdateStore {
    conn: Mutex<Connection>,
}

impl UpdateStore {
    /// Open (or create) the log at `path`, creating parent directories as
    /// needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory log for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one encoded update.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        self.conn()
            .execute("INSERT INTO updates (payload) VALUES (?1)", params![payload])?;
        Ok(())
    }

    /// All stored updates in insertion order.
    pub fn load_all(&self) -> Result<Vec<Vec<u8>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT payload FROM updates ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut payloads = Vec::new();
        for row in rows {
            payloads.push(row?);
        }
        Ok(payloads)
    }

    /// Replace the whole history with a single merged snapshot row.
    pub fn compact(&self, snapshot: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM updates", [])?;
        tx.execute("INSERT INTO updates (payload) VALUES (?1)", params![snapshot])?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_count(&self) -> Result<u64> {
        let count: u64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM updates", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_load_preserve_order() {
        let store = UpdateStore::open_memory().unwrap();
        store.append(b"first").unwrap();
        store.append(b"second").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(store.update_count().unwrap(), 2);
    }

    #[test]
    fn compact_replaces_history() {
        let store = UpdateStore::open_memory().unwrap();
        store.append(b"a").unwrap();
        store.append(b"b").unwrap();
        store.compact(b"merged").unwrap();

        assert_eq!(store.update_count().unwrap(), 1);
        assert_eq!(store.load_all().unwrap(), vec![b"merged".to_vec()]);

        // Appends keep working after a compaction.
        store.append(b"c").unwrap();
        assert_eq!(store.update_count().unwrap(), 2);
    }

    #[test]
    fn reopen_sees_persisted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay-http.db");

        {
            let store = UpdateStore::open(&path).unwrap();
            store.append(b"durable").unwrap();
        }

        let store = UpdateStore::open(&path).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![b"durable".to_vec()]);
    }
}
