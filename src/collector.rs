//! Collector Layer
//!
//! Decouples result capture from persistence latency. Producers hand a
//! [`RunResult`](crate::storage::RunResult) to [`Collector::submit`], which
//! never blocks; a single consumer thread persists queued runs through a
//! [`RunSink`].
//!
//! # Architecture
//!
//! - [`Collector`]: bounded queue plus consumer thread (start / submit / stop)
//! - [`RunSink`]: persistence capability, either [`LocalPersist`] (embedded
//!   store) or [`RemoteUpload`] (aggregator via the uploader)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use testpulse::{Collector, CollectorConfig, LocalPersist, RunResult, StorageBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageBuilder::new("/tmp/history.db").build_embedded()?;
//! let mut collector = Collector::new(Arc::new(LocalPersist::new(store)), CollectorConfig::default());
//! collector.start();
//! collector.submit(RunResult::new(8, 2, 0, 0, 4.2));
//! collector.stop(Duration::from_secs(15));
//! # Ok(())
//! # }
//! ```

mod queue;
mod traits;

pub use queue::{
    Collector, CollectorConfig, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_STOP_TIMEOUT, Message,
};
pub use traits::{LocalPersist, RemoteUpload, RunSink, SinkError};
