//! Bounded producer/consumer queue with one background consumer thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::collector::traits::RunSink;
use crate::storage::RunResult;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default consumer poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bounded wait used by session teardown.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Back-off while waiting for room to enqueue the shutdown message.
const SHUTDOWN_RETRY_INTERVAL: Duration = Duration::from_millis(5);

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

/// Collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Maximum queued runs before submissions are dropped (default: 1024).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long the consumer waits on an empty queue (default: 1s).
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded wait for draining at session end (default: 15s).
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl CollectorConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Messages sent to the consumer thread.
#[derive(Debug)]
pub enum Message {
    /// A run to persist.
    Data(RunResult),
    /// Finish draining and exit.
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Handle to a running consumer.
struct Worker {
    tx: SyncSender<Message>,
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
}

/// Non-blocking run collector.
///
/// `submit` never blocks and never fails the caller: when the queue is full,
/// or the collector is not running, the run is dropped and counted. One
/// consumer thread persists queued runs in submission order through the
/// configured [`RunSink`].
pub struct Collector {
    config: CollectorConfig,
    sink: Arc<dyn RunSink>,
    worker: Option<Worker>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("sink", &self.sink.name())
            .field("running", &self.is_running())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Create a stopped collector persisting through `sink`.
    pub fn new(sink: Arc<dyn RunSink>, config: CollectorConfig) -> Self {
        Self {
            config,
            sink,
            worker: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Whether a consumer thread is currently attached.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Runs dropped because the queue was full or the collector stopped.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Runs the sink accepted.
    pub fn persisted(&self) -> u64 {
        self.counters.persisted.load(Ordering::Relaxed)
    }

    /// Runs the sink rejected (error or panic).
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Spawn the consumer thread.
    ///
    /// Returns `false` without side effects if one is already running or the
    /// thread could not be spawned.
    pub fn start(&mut self) -> bool {
        if self.worker.is_some() {
            return false;
        }

        let (tx, rx) = mpsc::sync_channel(self.config.queue_capacity.max(1));
        let (done_tx, done_rx) = mpsc::channel();
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let poll_interval = self.config.poll_interval;

        let spawned = thread::Builder::new()
            .name("collector-consumer".into())
            .spawn(move || {
                consume(rx, sink.as_ref(), poll_interval, &counters);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!(
                    sink = self.sink.name(),
                    capacity = self.config.queue_capacity,
                    "Collector started"
                );
                self.worker = Some(Worker {
                    tx,
                    handle,
                    done_rx,
                });
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn collector consumer");
                false
            }
        }
    }

    /// Enqueue a run without blocking.
    ///
    /// Returns `true` when the run was queued.
    pub fn submit(&self, run: RunResult) -> bool {
        let Some(worker) = &self.worker else {
            tracing::warn!(run_id = ?run.run_id, "Collector not running, dropping run");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match worker.tx.try_send(Message::Data(run)) {
            Ok(()) => true,
            Err(TrySendError::Full(Message::Data(run))) => {
                tracing::warn!(
                    run_id = ?run.run_id,
                    capacity = self.config.queue_capacity,
                    "Queue full, dropping run"
                );
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(_) => {
                tracing::warn!("Collector consumer gone, dropping run");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Ask the consumer to drain and exit, waiting at most `timeout`.
    ///
    /// Returns `true` if the consumer finished in time. On timeout the
    /// consumer is detached and keeps draining in the background. Calling
    /// `stop` on a stopped collector is a no-op that returns `true`.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;

        let mut shutdown = Message::Shutdown;
        loop {
            match worker.tx.try_send(shutdown) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                Err(TrySendError::Full(msg)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        tracing::warn!(
                            ?timeout,
                            "Collector stop timed out with a full queue; pending runs may be lost"
                        );
                        return false;
                    }
                    shutdown = msg;
                    thread::sleep(remaining.min(SHUTDOWN_RETRY_INTERVAL));
                }
            }
        }
        drop(worker.tx);

        let remaining = deadline.saturating_duration_since(Instant::now());
        match worker.done_rx.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    tracing::error!("Collector consumer panicked");
                }
                tracing::debug!(
                    persisted = self.persisted(),
                    failed = self.failed(),
                    dropped = self.dropped(),
                    "Collector stopped"
                );
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    ?timeout,
                    "Collector stop timed out; consumer detached, pending runs may be lost"
                );
                false
            }
        }
    }
}

// =============================================================================
// Consumer
// =============================================================================

fn consume(rx: Receiver<Message>, sink: &dyn RunSink, poll_interval: Duration, counters: &Counters) {
    tracing::info!(sink = sink.name(), "Collector consumer started");

    loop {
        match rx.recv_timeout(poll_interval) {
            Ok(Message::Data(run)) => persist_one(sink, &run, counters),
            Ok(Message::Shutdown) => {
                tracing::debug!("Collector consumer received shutdown");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("Collector channel disconnected, consumer exiting");
                break;
            }
        }
    }

    tracing::info!(sink = sink.name(), "Collector consumer stopped");
}

fn persist_one(sink: &dyn RunSink, run: &RunResult, counters: &Counters) {
    let run_id = run.run_id.as_deref().unwrap_or("-");

    match panic::catch_unwind(AssertUnwindSafe(|| sink.persist(run))) {
        Ok(Ok(id)) => {
            counters.persisted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(sink = sink.name(), id = %id, "Run persisted");
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(sink = sink.name(), run_id, error = %e, "Run persistence failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(sink = sink.name(), run_id, "Sink panicked while persisting run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::traits::{LocalPersist, SinkError};
    use crate::storage::{EmbeddedStore, StorageError};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Sink that records `passed` counts after an artificial delay.
    struct RecordingSink {
        delay: Duration,
        seen: Mutex<Vec<u64>>,
    }

    impl RecordingSink {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl RunSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn persist(&self, run: &RunResult) -> Result<String, SinkError> {
            thread::sleep(self.delay);
            match run.passed {
                666 => panic!("boom"),
                13 => Err(SinkError::Storage(StorageError::Internal("unlucky".into()))),
                n => {
                    self.seen.lock().unwrap().push(n);
                    Ok(n.to_string())
                }
            }
        }
    }

    fn fast_config() -> CollectorConfig {
        CollectorConfig::default().with_poll_interval(Duration::from_millis(20))
    }

    fn run(passed: u64) -> RunResult {
        RunResult::new(passed, 0, 0, 0, 0.01)
    }

    #[test]
    fn test_submit_does_not_wait_for_slow_sink() {
        let sink = RecordingSink::new(Duration::from_millis(200));
        let mut collector = Collector::new(sink.clone(), fast_config());
        assert!(collector.start());

        let started = Instant::now();
        for n in 1..=5 {
            assert!(collector.submit(run(n)));
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(collector.stop(Duration::from_secs(10)));
        assert_eq!(sink.seen(), vec![1, 2, 3, 4, 5]);
        assert_eq!(collector.persisted(), 5);
    }

    #[test]
    fn test_stop_drains_into_store() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("h.db"), 2).unwrap();
        let mut collector = Collector::new(Arc::new(LocalPersist::new(store.clone())), fast_config());
        collector.start();

        for n in 1..=3 {
            collector.submit(run(n));
        }
        assert!(collector.stop(Duration::from_secs(5)));

        let history = store.get_history(10).unwrap();
        let passed: Vec<u64> = history.iter().map(|d| d.run.passed).collect();
        assert_eq!(passed, vec![3, 2, 1]);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let sink = RecordingSink::new(Duration::from_millis(300));
        let mut collector = Collector::new(sink, fast_config().with_queue_capacity(1));
        collector.start();

        let accepted = (1..=10).filter(|n| collector.submit(run(*n))).count();
        assert!(accepted <= 2);
        assert_eq!(collector.dropped(), (10 - accepted) as u64);

        collector.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_submit_without_start_is_dropped() {
        let sink = RecordingSink::new(Duration::ZERO);
        let collector = Collector::new(sink.clone(), fast_config());
        assert!(!collector.submit(run(1)));
        assert_eq!(collector.dropped(), 1);
        assert!(sink.seen().is_empty());
    }

    #[test]
    fn test_start_is_idempotent() {
        let sink = RecordingSink::new(Duration::ZERO);
        let mut collector = Collector::new(sink.clone(), fast_config());
        assert!(collector.start());
        assert!(!collector.start());
        assert!(collector.is_running());

        collector.submit(run(7));
        assert!(collector.stop(Duration::from_secs(5)));
        assert!(!collector.is_running());
        assert_eq!(sink.seen(), vec![7]);
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let mut collector = Collector::new(RecordingSink::new(Duration::ZERO), fast_config());
        assert!(collector.stop(Duration::from_millis(10)));
    }

    #[test]
    fn test_restart_after_stop() {
        let sink = RecordingSink::new(Duration::ZERO);
        let mut collector = Collector::new(sink.clone(), fast_config());

        collector.start();
        collector.submit(run(1));
        assert!(collector.stop(Duration::from_secs(5)));

        collector.start();
        collector.submit(run(2));
        assert!(collector.stop(Duration::from_secs(5)));

        assert_eq!(sink.seen(), vec![1, 2]);
    }

    #[test]
    fn test_stop_times_out_on_slow_sink() {
        let sink = RecordingSink::new(Duration::from_secs(2));
        let mut collector = Collector::new(sink, fast_config());
        collector.start();
        collector.submit(run(1));

        let started = Instant::now();
        assert!(!collector.stop(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!collector.is_running());
    }

    #[test]
    fn test_stop_with_full_queue_times_out_then_drains() {
        let sink = RecordingSink::new(Duration::from_millis(500));
        let mut collector = Collector::new(sink.clone(), fast_config().with_queue_capacity(1));
        collector.start();

        assert!(collector.submit(run(1)));
        // Let the consumer pick up the first run so the second one fills the queue.
        thread::sleep(Duration::from_millis(100));
        assert!(collector.submit(run(2)));

        let started = Instant::now();
        assert!(!collector.stop(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!collector.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while collector.persisted() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(sink.seen(), vec![1, 2]);
        assert_eq!(collector.persisted(), 2);
    }

    #[test]
    fn test_consumer_survives_errors_and_panics() {
        let sink = RecordingSink::new(Duration::ZERO);
        let mut collector = Collector::new(sink.clone(), fast_config());
        collector.start();

        collector.submit(run(666));
        collector.submit(run(13));
        collector.submit(run(2));
        assert!(collector.stop(Duration::from_secs(5)));

        assert_eq!(sink.seen(), vec![2]);
        assert_eq!(collector.persisted(), 1);
        assert_eq!(collector.failed(), 2);
    }

    #[test]
    fn test_config_from_yaml_uses_defaults() {
        let config: CollectorConfig = serde_yaml::from_str("poll_interval: 250ms").unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
    }
}
