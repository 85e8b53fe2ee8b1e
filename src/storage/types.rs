//! Core data types for test-run telemetry.
//!
//! - [`RunResult`]: one test-session outcome as captured by the producer
//! - [`FailureDetail`]: one failed test case inside a run
//! - Read-side rows: [`RunRecord`], [`RunDetail`], [`TrendPoint`],
//!   [`FailureStat`], [`WorkerSummary`]

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Maximum number of characters kept from a failure message.
pub const MAX_FAILURE_MESSAGE_CHARS: usize = 800;

/// Worker id used when neither the payload nor the host provides one.
pub const UNKNOWN_WORKER: &str = "unknown";

// =============================================================================
// Helpers
// =============================================================================

/// Derive the pass rate in percent, rounded to one decimal.
///
/// A zero-test run yields `0.0`.
pub fn pass_rate(passed: u64, total: u64) -> f64 {
    let rate = passed as f64 / total.max(1) as f64 * 100.0;
    round_to(rate, 1)
}

/// Round `value` to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Format a timestamp the way it is persisted (RFC 3339, second precision).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a persisted timestamp, falling back to the Unix epoch.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parse a submitted timestamp.
///
/// RFC 3339 strings keep their offset. Naive ISO 8601 strings (no offset,
/// either `T` or space separated, optional fractional seconds) are read as
/// UTC.
pub fn parse_submitted_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Deserialize an optional timestamp; absent or `null` means "now".
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(Utc::now()),
        Some(raw) => parse_submitted_timestamp(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid timestamp '{raw}'"))
        }),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// =============================================================================
// Write-side Types
// =============================================================================

/// One failed test case within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Stable test-case identifier (path + name), unique within one run.
    pub nodeid: String,
    /// Test duration in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Failure text, at most 800 characters.
    #[serde(default)]
    pub message: String,
}

impl FailureDetail {
    /// Create a failure detail, truncating the message to 800 characters.
    pub fn new(nodeid: impl Into<String>, duration: f64, message: impl AsRef<str>) -> Self {
        Self {
            nodeid: nodeid.into(),
            duration: duration.max(0.0),
            message: truncate_chars(message.as_ref(), MAX_FAILURE_MESSAGE_CHARS),
        }
    }
}

/// Dimension labels identifying the producer of a run.
///
/// Empty in embedded mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub project: String,
    pub branch: String,
}

impl WorkerIdentity {
    /// Create an identity. An empty `worker_id` falls back to the host name.
    pub fn new(
        worker_id: impl Into<String>,
        project: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        let worker_id = if worker_id.is_empty() {
            host_name()
        } else {
            worker_id
        };
        Self {
            worker_id,
            project: project.into(),
            branch: branch.into(),
        }
    }
}

/// Host name of this machine, or `"unknown"`.
pub fn host_name() -> String {
    sysinfo::System::host_name()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNKNOWN_WORKER.to_string())
}

/// One test-session outcome.
///
/// Created once per session by the producer, then owned by the collector
/// queue. `run_id` is present only for runs headed to an aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub error: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub pass_rate: f64,
    #[serde(default)]
    pub failures: Vec<FailureDetail>,
}

impl RunResult {
    /// Create a run from raw counts, stamped with the current time.
    ///
    /// `total` is the sum of the four counts; the pass rate is derived.
    pub fn new(passed: u64, failed: u64, error: u64, skipped: u64, duration: f64) -> Self {
        let mut run = Self {
            run_id: None,
            worker_id: String::new(),
            project: String::new(),
            branch: String::new(),
            timestamp: Utc::now(),
            passed,
            failed,
            error,
            skipped,
            total: 0,
            duration: duration.max(0.0),
            pass_rate: 0.0,
            failures: Vec::new(),
        };
        run.normalize();
        run
    }

    /// Attach failure details.
    pub fn with_failures(mut self, failures: Vec<FailureDetail>) -> Self {
        self.failures = failures;
        self
    }

    /// Attach a reported total (e.g. the engine's collected count).
    ///
    /// The larger of the reported value and the count sum is kept.
    pub fn with_reported_total(mut self, total: u64) -> Self {
        self.total = total;
        self.normalize();
        self
    }

    /// Tag the run for the aggregator: fresh `run_id` plus worker dimensions.
    pub fn for_worker(mut self, identity: &WorkerIdentity) -> Self {
        self.run_id = Some(uuid::Uuid::new_v4().to_string());
        self.worker_id = identity.worker_id.clone();
        self.project = identity.project.clone();
        self.branch = identity.branch.clone();
        self
    }

    /// Sum of the four outcome counts.
    pub fn counted_total(&self) -> u64 {
        self.passed + self.failed + self.error + self.skipped
    }

    /// Re-establish derived fields: `total = max(total, sum)` and `pass_rate`.
    ///
    /// Also clamps negative durations and cuts failure messages to 800
    /// characters.
    pub fn normalize(&mut self) {
        self.total = self.total.max(self.counted_total());
        self.duration = self.duration.max(0.0);
        self.pass_rate = pass_rate(self.passed, self.total);
        for failure in &mut self.failures {
            failure.duration = failure.duration.max(0.0);
            if failure.message.chars().count() > MAX_FAILURE_MESSAGE_CHARS {
                failure.message = truncate_chars(&failure.message, MAX_FAILURE_MESSAGE_CHARS);
            }
        }
    }

    /// Timestamp in its persisted text form.
    pub fn timestamp_text(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

// =============================================================================
// Read-side Types
// =============================================================================

/// Stored run summary (no failure details).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Store-assigned insertion sequence id.
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub worker_id: String,
    pub project: String,
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    pub passed: u64,
    pub failed: u64,
    pub error: u64,
    pub skipped: u64,
    pub total: u64,
    pub duration: f64,
    pub pass_rate: f64,
}

/// Stored run including its failure details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: RunRecord,
    pub failures: Vec<FailureDetail>,
}

/// One point of a pass-rate trend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub passed: u64,
    pub failed: u64,
    pub total: u64,
    pub pass_rate: f64,
    /// Present in aggregator mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Failure frequency of one test case over a window of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStat {
    pub nodeid: String,
    pub fail_count: u64,
}

/// Per-worker aggregate over all of its runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub run_count: u64,
    pub last_seen: DateTime<Utc>,
    pub avg_pass_rate: f64,
}

/// Dimension filters for run listing (AND semantics; `None` is unconstrained).
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub worker_id: Option<String>,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub limit: Option<u32>,
}
