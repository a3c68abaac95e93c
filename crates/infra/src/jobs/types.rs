//! Core job types: the execution record, progress log rows and retry policy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use bulkops_core::{ActorId, JobId, JobStatus, TransitionError};

use super::rollback::{CompensatingAction, RollbackReport};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for transient chunk failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries of a single chunk (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if more retries are allowed after `attempt` retries so far.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Configuration keys understood by the framework itself.
pub mod config_keys {
    pub const BATCH_SIZE: &str = "batch_size";
    pub const MIN_BATCH_SIZE: &str = "min_batch_size";
    pub const SHRINK_FACTOR: &str = "shrink_factor";
    pub const MEMORY_THRESHOLD_MB: &str = "memory_threshold_mb";
    pub const CPU_THRESHOLD_PERCENT: &str = "cpu_threshold_percent";
}

/// Per-job structured configuration (string-keyed JSON values).
///
/// Validated against a [`ConfigSchema`](super::validation::ConfigSchema)
/// before the job may leave `pending`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConfiguration(BTreeMap<String, JsonValue>);

impl JobConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framework defaults for every required key.
    pub fn defaults() -> Self {
        Self::new()
            .with(config_keys::BATCH_SIZE, 1000)
            .with(config_keys::MIN_BATCH_SIZE, 50)
            .with(config_keys::SHRINK_FACTOR, 0.5)
            .with(config_keys::MEMORY_THRESHOLD_MB, 2048)
            .with(config_keys::CPU_THRESHOLD_PERCENT, 90.0)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(JsonValue::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(JsonValue::as_f64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Fill missing keys from `other`, keeping values already present.
    pub fn merged_over(mut self, other: &JobConfiguration) -> Self {
        for (k, v) in &other.0 {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    pub fn batch_size(&self) -> usize {
        self.get_u64(config_keys::BATCH_SIZE).unwrap_or(1000) as usize
    }

    pub fn min_batch_size(&self) -> usize {
        self.get_u64(config_keys::MIN_BATCH_SIZE).unwrap_or(1) as usize
    }

    pub fn shrink_factor(&self) -> f64 {
        self.get_f64(config_keys::SHRINK_FACTOR).unwrap_or(0.5)
    }

    pub fn memory_threshold_mb(&self) -> f64 {
        self.get_f64(config_keys::MEMORY_THRESHOLD_MB).unwrap_or(f64::MAX)
    }

    pub fn cpu_threshold_percent(&self) -> f64 {
        self.get_f64(config_keys::CPU_THRESHOLD_PERCENT).unwrap_or(100.0)
    }
}

/// What a job operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobInput {
    /// A file to import (validated by the file gate before the job starts).
    File { path: PathBuf },
    /// A named migration; the job kind resolves the identifier to a data cursor.
    Migration { identifier: String },
    /// Items supplied inline by the caller.
    Inline { items: Vec<JsonValue> },
}

impl JobInput {
    pub fn describe(&self) -> String {
        match self {
            JobInput::File { path } => format!("file:{}", path.display()),
            JobInput::Migration { identifier } => format!("migration:{identifier}"),
            JobInput::Inline { items } => format!("inline:{} items", items.len()),
        }
    }
}

/// An item that failed per-item validation; the job continues without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidItem {
    /// Zero-based position of the item in the source.
    pub position: u64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<JsonValue>,
}

impl InvalidItem {
    pub fn new(position: u64, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
            item: None,
        }
    }

    pub fn with_item(mut self, item: JsonValue) -> Self {
        self.item = Some(item);
        self
    }
}

/// Snapshot of process resource usage and throughput.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<u64>,
    pub records_per_second: Option<f64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Severity of a progress log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// `processed / total * 100` clamped to `[0, 100]`; `None` when total is unknown.
pub fn progress_percentage(processed: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((processed as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

/// Durable state of one job execution.
///
/// Mutated only by the runner that owns the job id. Status changes go through
/// [`JobExecutionRecord::transition`], which enforces the core state machine
/// and maintains timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    /// Unique identity of the execution.
    pub version: JobId,
    pub name: String,
    /// Job kind this record is routed to.
    pub kind: String,
    pub status: JobStatus,
    pub admin_id: ActorId,
    pub input: JobInput,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub processed_records: u64,
    /// 0 means unknown (streaming source).
    pub total_records: u64,
    /// `None` while the total is unknown.
    pub progress_percentage: Option<f64>,

    pub configuration: JobConfiguration,
    /// Append-only, in application order.
    pub rollback_data: Vec<CompensatingAction>,
    pub rollback_report: Option<RollbackReport>,
    pub metrics: ResourceMetrics,
    pub invalid_items: Vec<InvalidItem>,

    /// Source offset of the first item not yet applied.
    pub checkpoint_offset: u64,
    pub current_batch_number: u64,
    pub current_batch_size: usize,
    /// Latest human-readable status note (e.g. why the job paused).
    pub status_message: Option<String>,

    pub error_message: Option<String>,
    pub error_backtrace: Option<String>,
    pub retry_count: u32,
    pub restart_count: u32,

    pub environment: String,
    pub hostname: Option<String>,
    pub process_id: u32,
}

impl JobExecutionRecord {
    pub fn new(
        version: JobId,
        name: impl Into<String>,
        kind: impl Into<String>,
        admin_id: ActorId,
        input: JobInput,
        configuration: JobConfiguration,
    ) -> Self {
        let now = Utc::now();
        Self {
            version,
            name: name.into(),
            kind: kind.into(),
            status: JobStatus::Pending,
            admin_id,
            input,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processed_records: 0,
            total_records: 0,
            progress_percentage: None,
            configuration,
            rollback_data: Vec::new(),
            rollback_report: None,
            metrics: ResourceMetrics::default(),
            invalid_items: Vec::new(),
            checkpoint_offset: 0,
            current_batch_number: 0,
            current_batch_size: 0,
            status_message: None,
            error_message: None,
            error_backtrace: None,
            retry_count: 0,
            restart_count: 0,
            environment: "development".to_string(),
            hostname: None,
            process_id: std::process::id(),
        }
    }

    /// Record where the job is executing.
    pub fn with_provenance(mut self, environment: impl Into<String>, hostname: Option<String>) -> Self {
        self.environment = environment.into();
        self.hostname = hostname;
        self.process_id = std::process::id();
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.version
    }

    /// Move to `to` if the state machine allows it.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        let next = self.status.transition(to)?;
        let now = Utc::now();

        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        if next == JobStatus::Completed {
            // Whatever was streamed is now the known total.
            if self.total_records < self.processed_records || self.total_records == 0 {
                self.total_records = self.processed_records;
            }
            self.progress_percentage = Some(100.0);
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Set the expected total once the source is opened.
    pub fn set_total(&mut self, total: Option<u64>) {
        if let Some(total) = total {
            self.total_records = total.max(self.processed_records);
            self.refresh_percentage();
        }
    }

    /// Account for a fully applied chunk of `count` items (valid or not).
    ///
    /// Counters only move while running; the percentage never regresses.
    pub fn record_chunk(&mut self, count: u64, batch_number: u64, batch_size: usize) {
        if self.status != JobStatus::Running {
            warn!(job_id = %self.version, status = %self.status, "ignoring progress outside running");
            return;
        }
        self.processed_records += count;
        self.checkpoint_offset += count;
        self.current_batch_number = batch_number;
        self.current_batch_size = batch_size;
        if self.total_records != 0 && self.processed_records > self.total_records {
            warn!(
                job_id = %self.version,
                processed = self.processed_records,
                total = self.total_records,
                "source yielded more items than announced; raising total"
            );
            self.total_records = self.processed_records;
        }
        self.refresh_percentage();
        self.updated_at = Utc::now();
    }

    fn refresh_percentage(&mut self) {
        if let Some(pct) = progress_percentage(self.processed_records, self.total_records) {
            let pinned = self.progress_percentage.unwrap_or(0.0);
            self.progress_percentage = Some(pct.max(pinned));
        }
    }

    /// Store an error and its cause chain.
    pub fn record_error(&mut self, err: &(dyn std::error::Error + 'static)) {
        self.error_message = Some(err.to_string());
        self.error_backtrace = Some(error_chain(err));
        self.updated_at = Utc::now();
    }

    /// Explicit restart: clear progress so the job can run again from the start.
    pub fn reset_for_restart(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.processed_records = 0;
        self.total_records = 0;
        self.progress_percentage = None;
        self.rollback_data.clear();
        self.rollback_report = None;
        self.invalid_items.clear();
        self.checkpoint_offset = 0;
        self.current_batch_number = 0;
        self.current_batch_size = 0;
        self.status_message = None;
        self.error_message = None;
        self.error_backtrace = None;
        self.retry_count = 0;
        self.restart_count += 1;
        self.process_id = std::process::id();
        self.updated_at = now;
    }
}

/// Render an error and its `source()` chain, one cause per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Append-only progress row; only the broadcast marker changes after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLogEntry {
    pub job_id: JobId,
    /// Per-job write order.
    pub sequence: u64,
    /// `restart_count` of the run that wrote the row.
    #[serde(default)]
    pub attempt: u32,
    pub phase: String,
    pub progress_percentage: Option<f64>,
    pub processed_records: u64,
    pub current_batch_size: usize,
    pub current_batch_number: u64,
    pub message: String,
    pub log_level: LogLevel,
    pub records_per_second: Option<f64>,
    pub estimated_remaining_seconds: Option<f64>,
    pub broadcasted: bool,
    pub broadcasted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> JobExecutionRecord {
        JobExecutionRecord::new(
            JobId::new(),
            "import customers",
            "csv_import",
            ActorId::new(),
            JobInput::Inline { items: vec![] },
            JobConfiguration::defaults(),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(10_000));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn percentage_is_clamped_and_indeterminate_without_total() {
        assert_eq!(progress_percentage(5, 0), None);
        assert_eq!(progress_percentage(50, 200), Some(25.0));
        assert_eq!(progress_percentage(300, 200), Some(100.0));
    }

    #[test]
    fn lifecycle_sets_timestamps() {
        let mut r = record();
        assert!(r.started_at.is_none());
        r.transition(JobStatus::Running).unwrap();
        assert!(r.started_at.is_some());
        assert!(r.completed_at.is_none());
        r.transition(JobStatus::Completed).unwrap();
        assert!(r.completed_at.is_some());
        assert_eq!(r.progress_percentage, Some(100.0));
    }

    #[test]
    fn progress_only_moves_while_running_and_never_regresses() {
        let mut r = record();
        r.transition(JobStatus::Running).unwrap();
        r.set_total(Some(10));
        r.record_chunk(4, 1, 4);
        assert_eq!(r.progress_percentage, Some(40.0));

        r.transition(JobStatus::Paused).unwrap();
        r.record_chunk(4, 2, 4);
        assert_eq!(r.processed_records, 4);
        assert_eq!(r.progress_percentage, Some(40.0));

        r.transition(JobStatus::Running).unwrap();
        // A larger total would lower the ratio; the pinned value wins.
        r.set_total(Some(100));
        assert_eq!(r.progress_percentage, Some(40.0));
    }

    #[test]
    fn processed_never_exceeds_known_total() {
        let mut r = record();
        r.transition(JobStatus::Running).unwrap();
        r.set_total(Some(3));
        r.record_chunk(5, 1, 5);
        assert!(r.processed_records <= r.total_records);
        assert_eq!(r.progress_percentage, Some(100.0));
    }

    #[test]
    fn streaming_job_completes_at_hundred_percent() {
        let mut r = record();
        r.transition(JobStatus::Running).unwrap();
        r.record_chunk(7, 1, 7);
        assert_eq!(r.progress_percentage, None);
        r.transition(JobStatus::Completed).unwrap();
        assert_eq!(r.total_records, 7);
        assert_eq!(r.progress_percentage, Some(100.0));
    }

    #[test]
    fn restart_resets_progress() {
        let mut r = record();
        r.transition(JobStatus::Running).unwrap();
        r.record_chunk(3, 1, 3);
        r.transition(JobStatus::Failed).unwrap();
        r.reset_for_restart();
        assert_eq!(r.status, JobStatus::Pending);
        assert_eq!(r.processed_records, 0);
        assert_eq!(r.restart_count, 1);
        assert!(r.completed_at.is_none());
    }

    #[test]
    fn error_chain_lists_causes() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        let chain = error_chain(&outer);
        assert!(chain.contains("disk gone"));
    }

    #[test]
    fn configuration_merge_keeps_explicit_values() {
        let cfg = JobConfiguration::new()
            .with("batch_size", 10)
            .merged_over(&JobConfiguration::defaults());
        assert_eq!(cfg.batch_size(), 10);
        assert_eq!(cfg.min_batch_size(), 50);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Total(Option<u64>),
        Chunk(u64),
        Restart,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => prop::option::of(0u64..500).prop_map(Step::Total),
            6 => (0u64..80).prop_map(Step::Chunk),
            1 => Just(Step::Restart),
        ]
    }

    proptest! {
        #[test]
        fn percentage_is_monotonic_within_an_attempt(steps in prop::collection::vec(step(), 1..60)) {
            let mut r = record();
            r.transition(JobStatus::Running).unwrap();
            let mut last: Option<f64> = None;
            let mut batch = 0u64;

            for step in steps {
                match step {
                    Step::Total(total) => r.set_total(total),
                    Step::Chunk(n) => {
                        batch += 1;
                        r.record_chunk(n, batch, n as usize);
                    }
                    Step::Restart => {
                        r.transition(JobStatus::Failed).unwrap();
                        r.reset_for_restart();
                        r.transition(JobStatus::Running).unwrap();
                        last = None;
                        batch = 0;
                    }
                }

                if r.total_records != 0 {
                    prop_assert!(r.processed_records <= r.total_records);
                }
                if let Some(pct) = r.progress_percentage {
                    prop_assert!((0.0..=100.0).contains(&pct));
                }
                if let Some(prev) = last {
                    let now = r.progress_percentage;
                    prop_assert!(now.is_some_and(|p| p >= prev), "{prev} regressed to {now:?}");
                }
                last = r.progress_percentage.or(last);
            }
        }
    }
}
