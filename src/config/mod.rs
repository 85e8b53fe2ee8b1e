//! Configuration module for testpulse.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (history and aggregator paths, pool size)
//! - Collector queue, uploader retry policy and worker identity

mod app;
mod validation;

pub use app::{AppConfig, DatabaseConfig, ServerConfig, WorkerConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration, validate_endpoint};

// Re-export constants
pub use app::{
    DEFAULT_AGGREGATOR_DB_PATH, DEFAULT_CONFIG_PATH, DEFAULT_DB_PATH, DEFAULT_POOL_SIZE,
};
