//! Reader connection pool using r2d2.

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::storage::StorageError;

/// Pragmas applied to every pooled reader connection.
const READER_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;";

/// Connection pool for concurrent read operations.
pub struct ReadPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReadPool {
    /// Create a new read pool.
    ///
    /// Note: Schema is expected to be initialized by the writer before this is called.
    pub fn new(db_path: &Path, size: u32) -> Result<Arc<Self>, StorageError> {
        let manager =
            SqliteConnectionManager::file(db_path).with_init(|c| c.execute_batch(READER_PRAGMAS));
        let pool = Pool::builder().max_size(size.max(1)).build(manager)?;

        Ok(Arc::new(Self { pool }))
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{SchemaKind, init_schema};
    use tempfile::tempdir;

    #[test]
    fn test_pool_creation() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        // Create the database file first with schema
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        init_schema(&conn, SchemaKind::Aggregator).unwrap();
        drop(conn);

        let pool = ReadPool::new(&db_path, 4).unwrap();
        let conn = pool.get().unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'failures'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
