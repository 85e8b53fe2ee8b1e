//! Aggregator result store.
//!
//! Collects runs uploaded by many workers. Runs are keyed by the producer's
//! `run_id`; saving an existing `run_id` replaces the run row and all of its
//! failure rows in one transaction, so retried uploads are safe to repeat.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{OptionalExtension, Row, ToSql, params};

use crate::storage::StorageError;
use crate::storage::analytics::{chronological, clamp_limit};
use crate::storage::database::Database;
use crate::storage::embedded::{count_from_sql, count_to_sql};
use crate::storage::schema::SchemaKind;
use crate::storage::types::{
    FailureDetail, FailureStat, RunDetail, RunQuery, RunRecord, RunResult, TrendPoint,
    UNKNOWN_WORKER, WorkerSummary, parse_timestamp, round_to,
};

/// Default page size for [`AggregatorStore::get_runs`].
pub const DEFAULT_RUNS_LIMIT: u32 = 50;

/// Default trend length.
pub const DEFAULT_TREND_LIMIT: u32 = 10;

/// Default failure-stats window, in runs.
pub const DEFAULT_STATS_WINDOW: u32 = 100;

const RUN_COLUMNS: &str = "id, run_id, worker_id, project, branch, timestamp, \
     passed, failed, error, skipped, total, duration, pass_rate";

/// Multi-producer run store with dimension filters.
#[derive(Clone)]
pub struct AggregatorStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for AggregatorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorStore")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

impl AggregatorStore {
    /// Open (or create) an aggregator store at `path`.
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StorageError> {
        let db = Database::open(path.as_ref(), SchemaKind::Aggregator, pool_size)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Upsert a run by `run_id` and return the `run_id`.
    ///
    /// The run row and its failure rows are written as one atomic unit.
    /// Re-saving the same `run_id` drops the previous failure rows and gives
    /// the run a new insertion sequence id.
    pub fn save_run(&self, run: &RunResult) -> Result<String, StorageError> {
        let run_id = run
            .run_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StorageError::InvalidData("run_id is required".to_string()))?
            .to_string();
        let worker_id = if run.worker_id.is_empty() {
            UNKNOWN_WORKER
        } else {
            run.worker_id.as_str()
        };

        let replaced = self.db.write(|tx| {
            let replaced = tx.execute("DELETE FROM failures WHERE run_id = ?1", [&run_id])?;
            tx.execute(
                "INSERT OR REPLACE INTO runs
                   (run_id, worker_id, project, branch, timestamp,
                    passed, failed, error, skipped, total, duration, pass_rate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    run_id,
                    worker_id,
                    run.project,
                    run.branch,
                    run.timestamp_text(),
                    count_to_sql(run.passed),
                    count_to_sql(run.failed),
                    count_to_sql(run.error),
                    count_to_sql(run.skipped),
                    count_to_sql(run.total),
                    run.duration,
                    run.pass_rate,
                ],
            )?;

            let mut stmt = tx.prepare_cached(
                "INSERT INTO failures (run_id, nodeid, duration, message) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for f in &run.failures {
                stmt.execute(params![run_id, f.nodeid, f.duration, f.message])?;
            }
            Ok(replaced)
        })?;

        tracing::info!(
            run_id = %run_id,
            worker_id,
            failures = run.failures.len(),
            replaced_failures = replaced,
            "Run saved"
        );
        Ok(run_id)
    }

    /// One run with its failure details, or `None` if `run_id` is unknown.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunDetail>, StorageError> {
        let mut conn = self.db.reader()?;
        // Read both tables from one snapshot.
        let tx = conn.transaction()?;

        let run = tx
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                [run_id],
                map_record,
            )
            .optional()?;
        let Some(run) = run else {
            return Ok(None);
        };

        let failures = {
            let mut stmt = tx.prepare_cached(
                "SELECT nodeid, duration, message FROM failures WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([run_id], |row| {
                Ok(FailureDetail {
                    nodeid: row.get(0)?,
                    duration: row.get(1)?,
                    message: row.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.finish()?;

        Ok(Some(RunDetail { run, failures }))
    }

    /// Most recent runs, newest first, filtered by any provided dimensions.
    pub fn get_runs(&self, q: &RunQuery) -> Result<Vec<RunRecord>, StorageError> {
        let limit = clamp_limit(q.limit.unwrap_or(DEFAULT_RUNS_LIMIT));

        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1");
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref worker_id) = q.worker_id {
            sql.push_str(" AND worker_id = ?");
            params.push(Box::new(worker_id.clone()));
        }
        if let Some(ref project) = q.project {
            sql.push_str(" AND project = ?");
            params.push(Box::new(project.clone()));
        }
        if let Some(ref branch) = q.branch {
            sql.push_str(" AND branch = ?");
            params.push(Box::new(branch.clone()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        params.push(Box::new(limit));

        let conn = self.db.reader()?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), map_record)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Most recent `limit` runs as trend points, oldest first.
    pub fn get_trend(
        &self,
        project: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TrendPoint>, StorageError> {
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, passed, failed, total, pass_rate, worker_id
             FROM runs
             WHERE (?1 IS NULL OR project = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project, clamp_limit(limit)], |row| {
            Ok(TrendPoint {
                timestamp: parse_timestamp(&row.get::<_, String>(0)?),
                passed: count_from_sql(row.get(1)?),
                failed: count_from_sql(row.get(2)?),
                total: count_from_sql(row.get(3)?),
                pass_rate: row.get(4)?,
                worker_id: Some(row.get(5)?),
            })
        })?;
        let newest_first = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(chronological(newest_first))
    }

    /// Failure frequency per `nodeid` over the most recent `limit` runs.
    ///
    /// The window is counted in runs (optionally only runs of `project`),
    /// not in time.
    pub fn get_failure_stats(
        &self,
        project: Option<&str>,
        limit: u32,
    ) -> Result<Vec<FailureStat>, StorageError> {
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT f.nodeid, COUNT(*) AS fail_count
             FROM failures f
             JOIN (SELECT run_id FROM runs
                   WHERE (?1 IS NULL OR project = ?1)
                   ORDER BY id DESC LIMIT ?2) w ON f.run_id = w.run_id
             GROUP BY f.nodeid
             ORDER BY fail_count DESC, f.nodeid ASC",
        )?;
        let rows = stmt.query_map(params![project, clamp_limit(limit)], |row| {
            Ok(FailureStat {
                nodeid: row.get(0)?,
                fail_count: count_from_sql(row.get(1)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// One summary row per distinct worker, most recently seen first.
    pub fn get_workers(&self) -> Result<Vec<WorkerSummary>, StorageError> {
        let conn = self.db.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT worker_id, COUNT(*) AS run_count, MAX(timestamp) AS last_seen,
                    AVG(pass_rate) AS avg_pass_rate
             FROM runs GROUP BY worker_id ORDER BY last_seen DESC, worker_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkerSummary {
                worker_id: row.get(0)?,
                run_count: count_from_sql(row.get(1)?),
                last_seen: parse_timestamp(&row.get::<_, String>(2)?),
                avg_pass_rate: round_to(row.get::<_, Option<f64>>(3)?.unwrap_or(0.0), 2),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Cheap readiness probe.
    pub fn ping(&self) -> Result<(), StorageError> {
        let conn = self.db.reader()?;
        conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        worker_id: row.get(2)?,
        project: row.get(3)?,
        branch: row.get(4)?,
        timestamp: parse_timestamp(&row.get::<_, String>(5)?),
        passed: count_from_sql(row.get(6)?),
        failed: count_from_sql(row.get(7)?),
        error: count_from_sql(row.get(8)?),
        skipped: count_from_sql(row.get(9)?),
        total: count_from_sql(row.get(10)?),
        duration: row.get(11)?,
        pass_rate: row.get(12)?,
    })
}
