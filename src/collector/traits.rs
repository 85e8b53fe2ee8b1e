//! Persistence capability used by the collector's consumer.

use thiserror::Error;

use crate::storage::{EmbeddedStore, RunResult, StorageError};
use crate::uploader::{UploadError, Uploader};

/// Errors a sink can report for one run.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Local store write failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upload to the aggregator failed.
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),
}

/// Where the consumer sends each run.
///
/// Implementations block for as long as persistence takes; they are only
/// ever called from the collector's consumer thread.
pub trait RunSink: Send + Sync + 'static {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Persist one run, returning an identifier for logging.
    fn persist(&self, run: &RunResult) -> Result<String, SinkError>;
}

/// Sink that appends runs to an embedded store.
#[derive(Debug, Clone)]
pub struct LocalPersist {
    store: EmbeddedStore,
}

impl LocalPersist {
    pub fn new(store: EmbeddedStore) -> Self {
        Self { store }
    }
}

impl RunSink for LocalPersist {
    fn name(&self) -> &str {
        "local"
    }

    fn persist(&self, run: &RunResult) -> Result<String, SinkError> {
        let id = self.store.save(run)?;
        Ok(id.to_string())
    }
}

/// Sink that ships runs to an aggregator through the uploader.
#[derive(Debug)]
pub struct RemoteUpload {
    uploader: Uploader,
}

impl RemoteUpload {
    pub fn new(uploader: Uploader) -> Self {
        Self { uploader }
    }
}

impl RunSink for RemoteUpload {
    fn name(&self) -> &str {
        "remote"
    }

    fn persist(&self, run: &RunResult) -> Result<String, SinkError> {
        Ok(self.uploader.upload(run)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::{Transport, TransportResponse, UploaderConfig};
    use std::time::Duration;
    use tempfile::tempdir;

    struct DownTransport;

    impl Transport for DownTransport {
        fn post_json(&self, _url: &str, _body: Vec<u8>) -> Result<TransportResponse, UploadError> {
            Err(UploadError::Connect("down".into()))
        }
    }

    #[test]
    fn test_local_persist_returns_surrogate_id() {
        let dir = tempdir().unwrap();
        let store = EmbeddedStore::open(dir.path().join("h.db"), 1).unwrap();
        let sink = LocalPersist::new(store.clone());

        let id = sink.persist(&RunResult::new(2, 0, 0, 0, 0.3)).unwrap();
        assert_eq!(id, store.get_last().unwrap().unwrap().run.id.to_string());
        assert_eq!(sink.name(), "local");
    }

    #[test]
    fn test_remote_upload_wraps_upload_error() {
        let config = UploaderConfig::new("http://nowhere")
            .with_max_retries(2)
            .with_retry_delay(Duration::ZERO);
        let sink = RemoteUpload::new(Uploader::with_transport(config, Box::new(DownTransport)));

        let err = sink.persist(&RunResult::new(1, 0, 0, 0, 0.1)).unwrap_err();
        assert!(matches!(
            err,
            SinkError::Upload(UploadError::Exhausted { attempts: 2, .. })
        ));
    }
}
