//! Storage builder.
//!
//! Provides a builder pattern for opening either store flavour with a
//! consistent reader-pool configuration.

use std::path::{Path, PathBuf};

use crate::storage::StorageError;
use crate::storage::aggregator::AggregatorStore;
use crate::storage::embedded::EmbeddedStore;

/// Minimum connection pool size.
const MIN_POOL_SIZE: u32 = 2;

/// Maximum connection pool size.
const MAX_POOL_SIZE: u32 = 32;

/// Calculate default pool size based on available CPU parallelism.
///
/// Returns the number of available CPUs, clamped between MIN_POOL_SIZE and MAX_POOL_SIZE.
fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|p| (p.get() as u32).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE))
        .unwrap_or(4)
}

/// Builder for opening a result store.
pub struct StorageBuilder {
    db_path: PathBuf,
    pool_size: u32,
}

impl StorageBuilder {
    /// Create a new storage builder.
    ///
    /// Pool size defaults to the number of available CPUs (clamped to 2-32).
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            pool_size: default_pool_size(),
        }
    }

    /// Set the connection pool size for readers.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size.clamp(1, MAX_POOL_SIZE);
        self
    }

    /// Open an embedded (single-process) store.
    pub fn build_embedded(self) -> Result<EmbeddedStore, StorageError> {
        EmbeddedStore::open(&self.db_path, self.pool_size)
    }

    /// Open an aggregator (multi-producer) store.
    pub fn build_aggregator(self) -> Result<AggregatorStore, StorageError> {
        AggregatorStore::open(&self.db_path, self.pool_size)
    }
}
