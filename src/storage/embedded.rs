//! Embedded result store.
//!
//! Single-process history with no worker/project/branch dimensions. Every
//! save appends a row with a surrogate id; failure details are kept as JSON
//! text on the run row.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Row, params};

use crate::storage::StorageError;
use crate::storage::analytics::{chronological, clamp_limit, rank_failures};
use crate::storage::database::Database;
use crate::storage::schema::SchemaKind;
use crate::storage::types::{
    FailureDetail, FailureStat, RunDetail, RunRecord, RunResult, TrendPoint, parse_timestamp,
};

/// Default number of runs returned by [`EmbeddedStore::get_history`].
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// Default trend length.
pub const DEFAULT_TREND_LIMIT: u32 = 10;

/// Default failure-stats window, in runs.
pub const DEFAULT_STATS_WINDOW: u32 = 50;

const RUN_COLUMNS: &str =
    "id, timestamp, passed, failed, error, skipped, total, duration, pass_rate, failures";

/// Local run history for one execution context.
#[derive(Clone)]
pub struct EmbeddedStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStore")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

impl EmbeddedStore {
    /// Open (or create) an embedded store at `path`.
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StorageError> {
        let db = Database::open(path.as_ref(), SchemaKind::Embedded, pool_size)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Append a run and return its surrogate id.
    pub fn save(&self, run: &RunResult) -> Result<i64, StorageError> {
        let failures_json = serde_json::to_string(&run.failures)?;
        let id = self.db.write(|tx| {
            tx.execute(
                "INSERT INTO runs
                   (timestamp, passed, failed, error, skipped, total, duration, pass_rate, failures)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.timestamp_text(),
                    count_to_sql(run.passed),
                    count_to_sql(run.failed),
                    count_to_sql(run.error),
                    count_to_sql(run.skipped),
                    count_to_sql(run.total),
                    run.duration,
                    run.pass_rate,
                    failures_json,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        tracing::debug!(id, passed = run.passed, total = run.total, "Run saved");
        Ok(id)
    }

    /// Most recent run, or `None` when the store is empty.
    pub fn get_last(&self) -> Result<Option<RunDetail>, StorageError> {
        Ok(self.get_history(1)?.into_iter().next())
    }

    /// Most recent `limit` runs, newest first, with failure details.
    pub fn get_history(&self, limit: u32) -> Result<Vec<RunDetail>, StorageError> {
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([clamp_limit(limit)], map_detail)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Most recent `limit` runs as trend points, oldest first.
    pub fn get_trend(&self, limit: u32) -> Result<Vec<TrendPoint>, StorageError> {
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, passed, failed, total, pass_rate
             FROM runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([clamp_limit(limit)], |row| {
            Ok(TrendPoint {
                timestamp: parse_timestamp(&row.get::<_, String>(0)?),
                passed: count_from_sql(row.get(1)?),
                failed: count_from_sql(row.get(2)?),
                total: count_from_sql(row.get(3)?),
                pass_rate: row.get(4)?,
                worker_id: None,
            })
        })?;
        let newest_first = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(chronological(newest_first))
    }

    /// Failure frequency per `nodeid` over the most recent `limit` runs.
    pub fn get_failure_stats(&self, limit: u32) -> Result<Vec<FailureStat>, StorageError> {
        let conn = self.db.reader()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, failures FROM runs ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map([clamp_limit(limit)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut nodeids = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            nodeids.extend(parse_failures(id, &raw).into_iter().map(|f| f.nodeid));
        }
        Ok(rank_failures(nodeids))
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

/// Store a count as SQLite INTEGER.
pub(crate) fn count_to_sql(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Read a SQLite INTEGER back as a count; negatives clamp to zero.
pub(crate) fn count_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Decode the failures column. Malformed JSON reads as "no failures".
fn parse_failures(id: i64, raw: &str) -> Vec<FailureDetail> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(id, error = %e, "Malformed failures column, treating as empty");
        Vec::new()
    })
}

fn map_detail(row: &Row<'_>) -> rusqlite::Result<RunDetail> {
    let id: i64 = row.get(0)?;
    let run = RunRecord {
        id,
        run_id: None,
        worker_id: String::new(),
        project: String::new(),
        branch: String::new(),
        timestamp: parse_timestamp(&row.get::<_, String>(1)?),
        passed: count_from_sql(row.get(2)?),
        failed: count_from_sql(row.get(3)?),
        error: count_from_sql(row.get(4)?),
        skipped: count_from_sql(row.get(5)?),
        total: count_from_sql(row.get(6)?),
        duration: row.get(7)?,
        pass_rate: row.get(8)?,
    };
    let raw: Option<String> = row.get(9)?;
    let failures = parse_failures(id, raw.as_deref().unwrap_or("[]"));
    Ok(RunDetail { run, failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn open_store() -> (EmbeddedStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("history.db"), 2).unwrap();
        (store, dir)
    }

    fn run_failing(passed: u64, nodeids: &[&str]) -> RunResult {
        let failures = nodeids
            .iter()
            .map(|n| FailureDetail::new(*n, 0.1, "assert False"))
            .collect();
        RunResult::new(passed, nodeids.len() as u64, 0, 0, 1.0).with_failures(failures)
    }

    #[test]
    fn test_save_assigns_increasing_ids() {
        let (store, _dir) = open_store();
        let a = store.save(&RunResult::new(1, 0, 0, 0, 0.1)).unwrap();
        let b = store.save(&RunResult::new(1, 0, 0, 0, 0.1)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_scenario_save_then_read() {
        let (store, _dir) = open_store();
        let run = RunResult::new(8, 2, 0, 0, 4.2);
        store.save(&run).unwrap();

        let last = store.get_last().unwrap().expect("run stored");
        assert_eq!(last.run.pass_rate, 80.0);
        assert_eq!(last.run.total, 10);
        assert_eq!(last.run.duration, 4.2);

        let trend = store.get_trend(1).unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].pass_rate, 80.0);
        assert!(trend[0].worker_id.is_none());
    }

    #[test]
    fn test_get_last_empty_store() {
        let (store, _dir) = open_store();
        assert!(store.get_last().unwrap().is_none());
        assert!(store.get_history(10).unwrap().is_empty());
        assert!(store.get_trend(10).unwrap().is_empty());
    }

    #[test]
    fn test_history_newest_first_and_trend_chronological() {
        let (store, _dir) = open_store();
        for passed in [1, 2, 3] {
            store.save(&RunResult::new(passed, 0, 0, 0, 0.1)).unwrap();
        }

        let history = store.get_history(3).unwrap();
        let scan: Vec<u64> = history.iter().map(|d| d.run.passed).collect();
        assert_eq!(scan, vec![3, 2, 1]);

        let trend: Vec<u64> = store.get_trend(3).unwrap().iter().map(|p| p.passed).collect();
        assert_eq!(trend, vec![1, 2, 3]);

        let trend: Vec<u64> = store.get_trend(2).unwrap().iter().map(|p| p.passed).collect();
        assert_eq!(trend, vec![2, 3]);
    }

    #[test]
    fn test_failures_roundtrip() {
        let (store, _dir) = open_store();
        store.save(&run_failing(3, &["t::a", "t::b"])).unwrap();
        let last = store.get_last().unwrap().unwrap();
        let ids: Vec<&str> = last.failures.iter().map(|f| f.nodeid.as_str()).collect();
        assert_eq!(ids, vec!["t::a", "t::b"]);
    }

    #[test]
    fn test_failure_stats_window() {
        let (store, _dir) = open_store();
        // X fails in runs 1, 3 and 5; only runs 3..=5 are inside the window.
        store.save(&run_failing(1, &["X"])).unwrap();
        store.save(&run_failing(1, &["Y"])).unwrap();
        store.save(&run_failing(1, &["X", "Y"])).unwrap();
        store.save(&run_failing(1, &[])).unwrap();
        store.save(&run_failing(1, &["X"])).unwrap();

        let stats = store.get_failure_stats(3).unwrap();
        assert_eq!(stats[0], FailureStat { nodeid: "X".into(), fail_count: 2 });
        assert_eq!(stats[1], FailureStat { nodeid: "Y".into(), fail_count: 1 });

        let all = store.get_failure_stats(5).unwrap();
        assert_eq!(all[0].fail_count, 3);
        assert_eq!(all[1].fail_count, 2);
    }

    #[test]
    fn test_malformed_failures_json_reads_as_empty() {
        let (store, _dir) = open_store();
        store.save(&run_failing(1, &["X"])).unwrap();
        store
            .db
            .write(|tx| {
                tx.execute("UPDATE runs SET failures = '{not json'", [])?;
                Ok(())
            })
            .unwrap();

        let last = store.get_last().unwrap().unwrap();
        assert!(last.failures.is_empty());
        assert!(store.get_failure_stats(10).unwrap().is_empty());
    }
}
