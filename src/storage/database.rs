//! SQLite database handle with serialized writes and pooled reads.
//!
//! Single-writer pattern: one connection owns all writes behind a mutex and
//! every write runs inside one `IMMEDIATE` transaction, so a run row and its
//! failure rows become visible to readers together. Readers check out
//! connections from an r2d2 pool and run concurrently with the writer (WAL).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::storage::StorageError;
use crate::storage::pool::ReadPool;
use crate::storage::schema::{SchemaKind, init_schema};

/// Pragmas for the writer connection.
///
/// - WAL journal mode so readers never block on the writer
/// - Normal synchronous mode for performance with durability
const WRITER_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Shared database handle.
pub struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Arc<ReadPool>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: &Path, kind: SchemaKind, pool_size: u32) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(WRITER_PRAGMAS)?;
        init_schema(&conn, kind)?;

        let readers = ReadPool::new(path, pool_size)?;
        tracing::info!(path = %path.display(), ?kind, pool_size, "Database opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            readers,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside one immediate transaction on the writer connection.
    ///
    /// Commits when `f` succeeds, rolls back (on drop) when it fails.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| StorageError::Internal("writer lock poisoned".to_string()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Check out a reader connection.
    pub fn reader(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.readers.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/results.db");
        let db = Database::open(&path, SchemaKind::Embedded, 2).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("wal.db"), SchemaKind::Embedded, 2).unwrap();
        let conn = db.reader().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("rb.db"), SchemaKind::Embedded, 2).unwrap();

        let result: Result<(), StorageError> = db.write(|tx| {
            tx.execute(
                "INSERT INTO runs (timestamp) VALUES ('2024-01-01T00:00:00Z')",
                [],
            )?;
            Err(StorageError::InvalidData("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .reader()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
