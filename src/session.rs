//! Session hooks: turn raw test-engine statistics into a run and hand it to
//! the collector without blocking the engine's exit path.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::collector::Collector;
use crate::storage::{FailureDetail, RunResult, WorkerIdentity, round_to};

/// One failed test as reported by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailedReport {
    pub nodeid: String,
    #[serde(default)]
    pub duration: f64,
    /// Captured failure text; truncated when the run is built.
    #[serde(default)]
    pub message: String,
}

/// Aggregate statistics handed over at session finish.
///
/// Every field is optional on the wire so partially populated reports (for
/// example after a collection error) still produce a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStats {
    pub passed: u64,
    pub failed: u64,
    pub error: u64,
    pub skipped: u64,
    /// Number of tests the engine collected; may exceed the outcome sum.
    pub collected: u64,
    /// Engine-measured duration in seconds, preferred over the session clock.
    pub duration: Option<f64>,
    pub failures: Vec<FailedReport>,
}

/// Where finished runs go.
#[derive(Debug, Clone)]
pub enum SessionMode {
    /// Local history: no run_id, empty dimensions.
    Embedded,
    /// Aggregator upload: fresh run_id plus the worker's dimensions.
    Worker(WorkerIdentity),
}

/// One test session owning its collector.
#[derive(Debug)]
pub struct TestSession {
    collector: Collector,
    mode: SessionMode,
    stop_timeout: Duration,
    started_at: Option<Instant>,
}

impl TestSession {
    /// Create a session. The stop timeout comes from the collector config.
    pub fn new(collector: Collector, mode: SessionMode) -> Self {
        let stop_timeout = collector.config().stop_timeout;
        Self {
            collector,
            mode,
            stop_timeout,
            started_at: None,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    /// Start the consumer and the session clock.
    pub fn session_start(&mut self) {
        self.started_at = Some(Instant::now());
        self.collector.start();
        tracing::debug!(mode = self.mode_label(), "Session started");
    }

    /// Build the run, submit it and wait a bounded time for the drain.
    ///
    /// Never fails: returns whether the collector drained within the stop
    /// timeout. Missing statistics produce a zero-count run.
    pub fn session_finish(&mut self, stats: Option<&SessionStats>) -> bool {
        let elapsed = self
            .started_at
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        if stats.is_none() {
            tracing::warn!("Session finished without statistics, recording empty run");
        }
        let run = self.build_run(stats, elapsed);
        tracing::info!(
            run_id = ?run.run_id,
            passed = run.passed,
            failed = run.failed,
            total = run.total,
            pass_rate = run.pass_rate,
            "Session finished"
        );

        // Lazily started when the engine skipped the start hook.
        self.collector.start();
        self.collector.submit(run);
        self.collector.stop(self.stop_timeout)
    }

    /// Assemble a run from engine statistics.
    pub fn build_run(&self, stats: Option<&SessionStats>, elapsed_secs: f64) -> RunResult {
        let default_stats = SessionStats::default();
        let stats = stats.unwrap_or(&default_stats);

        let duration = stats.duration.unwrap_or(elapsed_secs);
        let failures = stats
            .failures
            .iter()
            .map(|f| FailureDetail::new(f.nodeid.clone(), round_to(f.duration, 3), &f.message))
            .collect();

        let run = RunResult::new(
            stats.passed,
            stats.failed,
            stats.error,
            stats.skipped,
            round_to(duration, 2),
        )
        .with_reported_total(stats.collected)
        .with_failures(failures);

        match &self.mode {
            SessionMode::Embedded => run,
            SessionMode::Worker(identity) => run.for_worker(identity),
        }
    }

    fn mode_label(&self) -> &'static str {
        match self.mode {
            SessionMode::Embedded => "embedded",
            SessionMode::Worker(_) => "worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorConfig, LocalPersist};
    use crate::storage::EmbeddedStore;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn embedded_session() -> (TestSession, EmbeddedStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("h.db"), 2).unwrap();
        let config = CollectorConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_timeout(Duration::from_secs(5));
        let collector = Collector::new(Arc::new(LocalPersist::new(store.clone())), config);
        (TestSession::new(collector, SessionMode::Embedded), store, dir)
    }

    #[test]
    fn test_finish_persists_run() {
        let (mut session, store, _dir) = embedded_session();
        session.session_start();

        let stats = SessionStats {
            passed: 8,
            failed: 2,
            duration: Some(4.2),
            failures: vec![FailedReport {
                nodeid: "tests/test_a.py::test_x".into(),
                duration: 0.12345,
                message: "E".repeat(1000),
            }],
            ..Default::default()
        };
        assert!(session.session_finish(Some(&stats)));

        let last = store.get_last().unwrap().unwrap();
        assert_eq!(last.run.total, 10);
        assert_eq!(last.run.pass_rate, 80.0);
        assert_eq!(last.run.duration, 4.2);
        assert_eq!(last.failures[0].duration, 0.123);
        assert_eq!(last.failures[0].message.chars().count(), 800);
    }

    #[test]
    fn test_finish_without_stats_records_zero_run() {
        let (mut session, store, _dir) = embedded_session();
        session.session_start();
        assert!(session.session_finish(None));

        let last = store.get_last().unwrap().unwrap();
        assert_eq!(last.run.total, 0);
        assert_eq!(last.run.pass_rate, 0.0);
    }

    #[test]
    fn test_finish_without_start_still_persists() {
        let (mut session, store, _dir) = embedded_session();
        assert!(session.session_finish(Some(&SessionStats {
            passed: 1,
            ..Default::default()
        })));
        assert_eq!(store.get_history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_collected_total_wins_when_larger() {
        let (session, _store, _dir) = embedded_session();
        let stats = SessionStats {
            collected: 12,
            passed: 3,
            ..Default::default()
        };
        let run = session.build_run(Some(&stats), 1.0);
        assert_eq!(run.total, 12);
        assert_eq!(run.pass_rate, 25.0);
    }

    #[test]
    fn test_elapsed_used_when_engine_duration_missing() {
        let (session, _store, _dir) = embedded_session();
        let run = session.build_run(None, 1.23456);
        assert_eq!(run.duration, 1.23);
        assert!(run.run_id.is_none());
        assert!(run.worker_id.is_empty());
    }

    #[test]
    fn test_worker_mode_tags_run() {
        let (session, _store, _dir) = embedded_session();
        let identity = WorkerIdentity::new("ci-7", "shop", "main");
        let session = TestSession {
            mode: SessionMode::Worker(identity),
            ..session
        };

        let a = session.build_run(None, 0.0);
        let b = session.build_run(None, 0.0);
        assert_eq!(a.worker_id, "ci-7");
        assert_eq!(a.project, "shop");
        assert_eq!(a.branch, "main");
        assert!(a.run_id.is_some());
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn test_stats_accept_partial_json() {
        let stats: SessionStats = serde_json::from_str(r#"{"passed": 4}"#).unwrap();
        assert_eq!(stats.passed, 4);
        assert!(stats.failures.is_empty());
        assert!(stats.duration.is_none());
    }
}
