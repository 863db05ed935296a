pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

pub const DEFAULT_READER_POOL_SIZE: usize = 4;

/// Pooled SQLite store: one writer plus a fixed set of read-only readers.
///
/// Every access locks exactly one connection. When all connections of the
/// requested kind are busy the caller blocks until one is released, so callers
/// on the async runtime must go through `spawn_blocking`.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_idx: AtomicUsize,
}

impl Database {
    pub fn open(path: &Path, reader_pool_size: usize) -> Result<Self> {
        let writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run(&writer)?;

        let mut readers = Vec::with_capacity(reader_pool_size);
        for _ in 0..reader_pool_size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            readers.push(Mutex::new(conn));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            reader_pool_size
        );
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
        })
    }

    /// Private in-memory database with no reader pool; reads use the writer.
    pub fn open_in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&writer)?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            reader_idx: AtomicUsize::new(0),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            return self.with_conn_mut(f);
        }

        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx]
            .lock()
            .map_err(|e| anyhow::anyhow!("Reader lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Writer lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Run `f` inside a transaction on the writer. Commits when `f` returns
    /// `Ok`; any `Err` drops the transaction, which rolls it back.
    pub fn with_tx<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Writer lock poisoned: {}", e))?;
        let tx = conn.transaction().map_err(anyhow::Error::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(value)
    }

    pub fn reader_pool_size(&self) -> usize {
        self.readers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolled_back_transaction_leaves_no_rows() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO users (username, password_hash) VALUES ('ghost', 'x$y')",
                [],
            )?;
            Err(anyhow::anyhow!("abort"))
        });
        assert!(result.is_err());
        assert!(db.get_user_by_username("ghost").unwrap().is_none());
    }

    #[test]
    fn committed_transaction_is_visible() {
        let db = Database::open_in_memory().unwrap();

        let id: i64 = db
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO users (username, password_hash) VALUES ('kept', 'x$y')",
                    [],
                )?;
                Ok::<_, anyhow::Error>(tx.last_insert_rowid())
            })
            .unwrap();

        let user = db.get_user_by_id(id).unwrap().unwrap();
        assert_eq!(user.username, "kept");
        assert_eq!(db.reader_pool_size(), 0);
    }

    #[test]
    fn file_database_reads_through_reader_pool() {
        let dir = std::env::temp_dir().join(format!("chime_db_pool_{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("pool.db");
        let _ = std::fs::remove_file(&path);

        let db = Database::open(&path, 2).unwrap();
        let id = db.create_user("pooled", "salt$digest", None).unwrap();
        assert_eq!(db.reader_pool_size(), 2);

        for _ in 0..4 {
            let user = db.get_user_by_id(id).unwrap().unwrap();
            assert_eq!(user.username, "pooled");
        }

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
