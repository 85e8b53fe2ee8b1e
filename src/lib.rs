//! testpulse - Test Result Telemetry Library
//!
//! Collects the outcome of every test session, ships it from worker nodes to
//! a central aggregator and answers trend and failure-frequency queries.
//!
//! # Architecture
//!
//! - **Session**: builds a run from raw engine statistics at session end
//! - **Collector**: non-blocking queue with one background consumer
//! - **Uploader**: bounded-retry delivery to the aggregator
//! - **Storage**: SQLite persistence, embedded or aggregator flavour
//! - **Server**: REST API over the aggregator store
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testpulse::{
//!     Collector, CollectorConfig, LocalPersist, SessionMode, SessionStats, StorageBuilder,
//!     TestSession,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageBuilder::new("reports/history.db").build_embedded()?;
//! let collector = Collector::new(Arc::new(LocalPersist::new(store)), CollectorConfig::default());
//! let mut session = TestSession::new(collector, SessionMode::Embedded);
//!
//! session.session_start();
//! // ... run tests ...
//! session.session_finish(Some(&SessionStats { passed: 8, failed: 2, ..Default::default() }));
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod server;
pub mod session;
pub mod storage;
pub mod uploader;

pub use collector::{Collector, CollectorConfig, LocalPersist, Message, RemoteUpload, RunSink, SinkError};
pub use session::{FailedReport, SessionMode, SessionStats, TestSession};
pub use storage::{
    AggregatorStore, EmbeddedStore, FailureDetail, FailureStat, RunDetail, RunQuery, RunRecord,
    RunResult, StorageBuilder, StorageError, TrendPoint, WorkerIdentity, WorkerSummary,
};
pub use uploader::{UploadError, UploadFailureKind, Uploader, UploaderConfig};
