//! Database schema definitions.
//!
//! Two layouts share the table name `runs` and live in separate files:
//! the embedded layout keeps failures as a JSON column, the aggregator
//! layout keeps them in a referencing `failures` table.

use rusqlite::Connection;

use crate::storage::StorageError;

/// Embedded store: one row per run, surrogate key, failures as JSON text.
pub const EMBEDDED_RUNS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp  TEXT    NOT NULL,
    passed     INTEGER NOT NULL DEFAULT 0,
    failed     INTEGER NOT NULL DEFAULT 0,
    error      INTEGER NOT NULL DEFAULT 0,
    skipped    INTEGER NOT NULL DEFAULT 0,
    total      INTEGER NOT NULL DEFAULT 0,
    duration   REAL    NOT NULL DEFAULT 0,
    pass_rate  REAL    NOT NULL DEFAULT 0,
    failures   TEXT    NOT NULL DEFAULT '[]'
);
"#;

/// Aggregator store: runs keyed by the producer's `run_id`.
///
/// `id` is the aggregator's own insertion sequence; listing and trend
/// queries order by it, never by the client-reported timestamp.
pub const AGGREGATOR_RUNS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT    NOT NULL UNIQUE,
    worker_id  TEXT    NOT NULL,
    project    TEXT    NOT NULL DEFAULT '',
    branch     TEXT    NOT NULL DEFAULT '',
    timestamp  TEXT    NOT NULL,
    passed     INTEGER NOT NULL DEFAULT 0,
    failed     INTEGER NOT NULL DEFAULT 0,
    error      INTEGER NOT NULL DEFAULT 0,
    skipped    INTEGER NOT NULL DEFAULT 0,
    total      INTEGER NOT NULL DEFAULT 0,
    duration   REAL    NOT NULL DEFAULT 0,
    pass_rate  REAL    NOT NULL DEFAULT 0
);
"#;

/// Aggregator failure details, one-to-many from `runs.run_id`.
pub const AGGREGATOR_FAILURES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS failures (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id    TEXT    NOT NULL REFERENCES runs(run_id),
    nodeid    TEXT    NOT NULL,
    duration  REAL    NOT NULL DEFAULT 0,
    message   TEXT    NOT NULL DEFAULT ''
);
"#;

/// Indexes backing the filtered and windowed aggregator queries.
pub const AGGREGATOR_INDEXES_DDL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_runs_worker  ON runs(worker_id);
CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project);
CREATE INDEX IF NOT EXISTS idx_runs_ts      ON runs(timestamp);
CREATE INDEX IF NOT EXISTS idx_failures_run ON failures(run_id);
"#;

/// Schema flavour selected by the store that opens the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Embedded,
    Aggregator,
}

/// Initialize the database schema for the given layout.
///
/// Creates all tables and indexes if they don't exist.
pub fn init_schema(conn: &Connection, kind: SchemaKind) -> Result<(), StorageError> {
    match kind {
        SchemaKind::Embedded => {
            conn.execute_batch(EMBEDDED_RUNS_TABLE_DDL)?;
        }
        SchemaKind::Aggregator => {
            conn.execute_batch(AGGREGATOR_RUNS_TABLE_DDL)?;
            conn.execute_batch(AGGREGATOR_FAILURES_TABLE_DDL)?;
            conn.execute_batch(AGGREGATOR_INDEXES_DDL)?;
        }
    }
    tracing::debug!(?kind, "Schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection, name: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_init_embedded_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, SchemaKind::Embedded).unwrap();
        assert_eq!(table_count(&conn, "runs"), 1);
        assert_eq!(table_count(&conn, "failures"), 0);
    }

    #[test]
    fn test_init_aggregator_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, SchemaKind::Aggregator).unwrap();
        init_schema(&conn, SchemaKind::Aggregator).unwrap();
        assert_eq!(table_count(&conn, "runs"), 1);
        assert_eq!(table_count(&conn, "failures"), 1);

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 4);
    }
}
