//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::collector::CollectorConfig;
use crate::storage::WorkerIdentity;
use crate::uploader::UploaderConfig;

use super::validation::{ConfigError, expand_env_vars, validate_endpoint};

// =============================================================================
// Constants
// =============================================================================

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// Default embedded history database.
pub const DEFAULT_DB_PATH: &str = "reports/history.db";

/// Default aggregator database.
pub const DEFAULT_AGGREGATOR_DB_PATH: &str = "data/results.db";

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_aggregator_path() -> String {
    DEFAULT_AGGREGATOR_DB_PATH.to_string()
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Aggregator API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Embedded history file (default: "reports/history.db").
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Aggregator store file (default: "data/results.db").
    #[serde(default = "default_aggregator_path")]
    pub aggregator_path: String,

    /// Connection pool size for read operations (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            aggregator_path: default_aggregator_path(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

/// Identity attached to runs uploaded from this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker id; the host name is used when unset.
    pub worker_id: Option<String>,
    pub project: String,
    pub branch: String,
}

impl WorkerConfig {
    /// Resolve into a worker identity.
    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity::new(
            self.worker_id.clone().unwrap_or_default(),
            self.project.clone(),
            self.branch.clone(),
        )
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Aggregator API server configuration.
    pub server: ServerConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Collector queue configuration.
    pub collector: CollectorConfig,

    /// Uploader configuration.
    pub uploader: UploaderConfig,

    /// Worker identity.
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.database.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "database pool_size must be positive".to_string(),
            ));
        }

        if self.collector.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "collector queue_capacity must be positive".to_string(),
            ));
        }

        if self.uploader.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "uploader max_retries must be at least 1".to_string(),
            ));
        }

        validate_endpoint(&self.uploader.endpoint)?;

        Ok(())
    }
}
