//! Reliable uploader for the aggregator path.
//!
//! Delivers one [`RunResult`] to the aggregator's `POST /results` endpoint
//! with a bounded number of attempts and a fixed delay between them. Every
//! failure mode is folded into [`UploadError`] and retried the same way.
//!
//! The uploader blocks (network I/O and retry sleeps), so it is meant to run
//! on a collector's consumer thread, never on the producer's thread.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::storage::RunResult;

/// Default number of attempts per run.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default aggregator base URL.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

/// Longest response body excerpt kept in an error.
const MAX_BODY_EXCERPT: usize = 200;

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

// =============================================================================
// Errors
// =============================================================================

/// Coarse classification of an upload failure, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum UploadFailureKind {
    Serialization,
    Status,
    MalformedResponse,
    Connect,
    Timeout,
    Socket,
    Config,
    Exhausted,
}

/// Any failure while delivering a run.
///
/// All variants except `Config` and `Exhausted` are produced by a single
/// attempt and are retried uniformly.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The run could not be encoded as JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The aggregator answered with a non-success status.
    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    /// The aggregator answered 2xx but the body was not a submit response.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request did not complete within the timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Low-level transport failure.
    #[error("socket error: {0}")]
    Socket(String),

    /// The uploader itself is misconfigured.
    #[error("invalid uploader configuration: {0}")]
    Config(String),

    /// Every attempt failed; the run is dropped from this path.
    #[error("upload abandoned after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<UploadError> },
}

impl UploadError {
    /// Classification for logs and counters.
    pub fn kind(&self) -> UploadFailureKind {
        match self {
            Self::Serialization(_) => UploadFailureKind::Serialization,
            Self::Status { .. } => UploadFailureKind::Status,
            Self::MalformedResponse(_) => UploadFailureKind::MalformedResponse,
            Self::Connect(_) => UploadFailureKind::Connect,
            Self::Timeout(_) => UploadFailureKind::Timeout,
            Self::Socket(_) => UploadFailureKind::Socket,
            Self::Config(_) => UploadFailureKind::Config,
            Self::Exhausted { .. } => UploadFailureKind::Exhausted,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else {
            Self::Socket(e.to_string())
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Raw response from the transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One blocking JSON POST.
pub trait Transport: Send + Sync {
    fn post_json(&self, url: &str, body: Vec<u8>) -> Result<TransportResponse, UploadError>;
}

/// Blocking HTTP transport using reqwest.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Config(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_json(&self, url: &str, body: Vec<u8>) -> Result<TransportResponse, UploadError> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(UploadError::from_reqwest)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().map_err(UploadError::from_reqwest)?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

// =============================================================================
// Uploader
// =============================================================================

/// Uploader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Aggregator base URL (default: "http://localhost:8080").
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Attempts per run, including the first (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts (default: 2s).
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Per-request timeout (default: 10s).
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl UploaderConfig {
    /// Create a config for `endpoint` with default retry settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Full URL of the submit endpoint.
    pub fn results_url(&self) -> String {
        format!("{}/results", self.endpoint.trim_end_matches('/'))
    }
}

/// Aggregator's answer to a submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: String,
    #[serde(default)]
    pub status: String,
}

/// Bounded-retry uploader.
pub struct Uploader {
    config: UploaderConfig,
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("endpoint", &self.config.endpoint)
            .field("max_retries", &self.config.max_retries)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Create an uploader backed by a blocking HTTP client.
    ///
    /// Must not be called from inside an async runtime.
    pub fn new(config: UploaderConfig) -> Result<Self, UploadError> {
        let transport = HttpTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Create an uploader with a custom transport.
    pub fn with_transport(config: UploaderConfig, transport: Box<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Deliver `run`, retrying up to `max_retries` attempts.
    ///
    /// Returns the `run_id` echoed by the aggregator. On exhaustion the run
    /// is dropped, logged as data loss, and `UploadError::Exhausted` is
    /// returned; nothing is re-queued.
    pub fn upload(&self, run: &RunResult) -> Result<String, UploadError> {
        let max_attempts = self.config.max_retries.max(1);
        let url = self.config.results_url();
        let run_id = run.run_id.as_deref().unwrap_or("-");
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(&url, run) {
                Ok(echoed) => {
                    tracing::info!(run_id = %echoed, attempt, "Run uploaded");
                    return Ok(echoed);
                }
                Err(e) => {
                    tracing::warn!(
                        run_id,
                        attempt,
                        max_attempts,
                        kind = e.kind().as_ref(),
                        error = %e,
                        "Upload attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        std::thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }

        let last = last_error.unwrap_or_else(|| UploadError::Socket("no attempt made".into()));
        tracing::error!(
            run_id,
            attempts = max_attempts,
            last_error = %last,
            "Upload retries exhausted, run dropped"
        );
        Err(UploadError::Exhausted {
            attempts: max_attempts,
            last: Box::new(last),
        })
    }

    fn attempt(&self, url: &str, run: &RunResult) -> Result<String, UploadError> {
        let body =
            serde_json::to_vec(run).map_err(|e| UploadError::Serialization(e.to_string()))?;
        let resp = self.transport.post_json(url, body)?;

        if !(200..300).contains(&resp.status) {
            return Err(UploadError::Status {
                status: resp.status,
                body: body_excerpt(&resp.body),
            });
        }

        let parsed: SubmitResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| UploadError::MalformedResponse(e.to_string()))?;
        if parsed.run_id.is_empty() {
            return Err(UploadError::MalformedResponse(
                "response carries an empty run_id".to_string(),
            ));
        }
        Ok(parsed.run_id)
    }
}

fn body_excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(MAX_BODY_EXCERPT)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport that replays scripted outcomes and counts calls.
    struct ScriptedTransport {
        calls: Arc<AtomicU32>,
        script: Mutex<Vec<Result<TransportResponse, UploadError>>>,
        fallback: fn() -> Result<TransportResponse, UploadError>,
    }

    impl ScriptedTransport {
        fn new(
            calls: Arc<AtomicU32>,
            mut script: Vec<Result<TransportResponse, UploadError>>,
            fallback: fn() -> Result<TransportResponse, UploadError>,
        ) -> Self {
            script.reverse();
            Self {
                calls,
                script: Mutex::new(script),
                fallback,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn post_json(&self, _url: &str, body: Vec<u8>) -> Result<TransportResponse, UploadError> {
            assert!(serde_json::from_slice::<RunResult>(&body).is_ok());
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| (self.fallback)())
        }
    }

    fn refused() -> Result<TransportResponse, UploadError> {
        Err(UploadError::Connect("connection refused".into()))
    }

    fn created(run_id: &str) -> Result<TransportResponse, UploadError> {
        Ok(TransportResponse {
            status: 201,
            body: format!(r#"{{"run_id":"{run_id}","status":"saved"}}"#).into_bytes(),
        })
    }

    fn fast_config(retries: u32) -> UploaderConfig {
        UploaderConfig::new("http://aggregator:8080/")
            .with_max_retries(retries)
            .with_retry_delay(Duration::ZERO)
    }

    fn sample_run() -> RunResult {
        let mut run = RunResult::new(1, 0, 0, 0, 0.1);
        run.run_id = Some("r-1".into());
        run.worker_id = "w".into();
        run
    }

    #[test]
    fn test_results_url() {
        assert_eq!(fast_config(1).results_url(), "http://aggregator:8080/results");
        assert_eq!(
            UploaderConfig::new("http://x").results_url(),
            "http://x/results"
        );
    }

    #[test]
    fn test_exhaustion_makes_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport::new(Arc::clone(&calls), vec![], refused);
        let uploader = Uploader::with_transport(fast_config(3), Box::new(transport));

        let err = uploader.upload(&sample_run()).unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            UploadError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.kind(), UploadFailureKind::Connect);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport::new(
            Arc::clone(&calls),
            vec![
                Err(UploadError::Timeout("slow".into())),
                Ok(TransportResponse {
                    status: 503,
                    body: b"busy".to_vec(),
                }),
                created("r-1"),
            ],
            refused,
        );
        let uploader = Uploader::with_transport(fast_config(3), Box::new(transport));

        assert_eq!(uploader.upload(&sample_run()).unwrap(), "r-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_malformed_body_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport::new(
            Arc::clone(&calls),
            vec![Ok(TransportResponse {
                status: 201,
                body: b"<html>".to_vec(),
            })],
            || created("r-1"),
        );
        let uploader = Uploader::with_transport(fast_config(2), Box::new(transport));

        assert_eq!(uploader.upload(&sample_run()).unwrap(), "r-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport::new(Arc::clone(&calls), vec![], refused);
        let uploader = Uploader::with_transport(fast_config(0), Box::new(transport));

        assert!(uploader.upload(&sample_run()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_error_keeps_body_excerpt() {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport::new(Arc::clone(&calls), vec![], || {
            Ok(TransportResponse {
                status: 422,
                body: "x".repeat(1000).into_bytes(),
            })
        });
        let uploader = Uploader::with_transport(fast_config(1), Box::new(transport));

        match uploader.upload(&sample_run()).unwrap_err() {
            UploadError::Exhausted { last, .. } => match *last {
                UploadError::Status { status, body } => {
                    assert_eq!(status, 422);
                    assert_eq!(body.len(), MAX_BODY_EXCERPT);
                }
                other => panic!("expected Status, got {other:?}"),
            },
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_kind_names() {
        assert_eq!(UploadFailureKind::MalformedResponse.as_ref(), "malformed_response");
        assert_eq!(UploadFailureKind::Timeout.to_string(), "timeout");
    }
}
