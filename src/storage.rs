//! Storage Layer
//!
//! SQLite persistence with serialized writes and pooled concurrent reads:
//! - **Writer**: one mutex-guarded connection, one transaction per write
//! - **Reader**: r2d2 connection pool, WAL snapshots
//!
//! # Components
//!
//! - [`EmbeddedStore`]: single-process history (surrogate ids, no dimensions)
//! - [`AggregatorStore`]: multi-worker store with idempotent upsert by `run_id`
//! - [`StorageBuilder`]: opens either store with a configured reader pool

mod aggregator;
mod analytics;
mod builder;
mod database;
mod embedded;
mod error;
mod pool;
mod schema;
mod types;

pub use aggregator::AggregatorStore;
pub use analytics::{MAX_LIMIT, chronological, rank_failures};
pub use builder::StorageBuilder;
pub use embedded::EmbeddedStore;
pub use error::StorageError;
pub use schema::SchemaKind;
pub use types::{
    FailureDetail, FailureStat, MAX_FAILURE_MESSAGE_CHARS, RunDetail, RunQuery, RunRecord,
    RunResult, TrendPoint, UNKNOWN_WORKER, WorkerIdentity, WorkerSummary, host_name,
    parse_submitted_timestamp, pass_rate, round_to,
};

/// Default limits used by the query surfaces.
pub mod defaults {
    pub use super::aggregator::{
        DEFAULT_RUNS_LIMIT, DEFAULT_STATS_WINDOW as AGGREGATOR_STATS_WINDOW,
        DEFAULT_TREND_LIMIT as AGGREGATOR_TREND_LIMIT,
    };
    pub use super::embedded::{
        DEFAULT_HISTORY_LIMIT, DEFAULT_STATS_WINDOW as EMBEDDED_STATS_WINDOW,
        DEFAULT_TREND_LIMIT as EMBEDDED_TREND_LIMIT,
    };
}
