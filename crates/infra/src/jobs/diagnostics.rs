//! Operational health heuristics over the record store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use bulkops_core::{JobId, JobStatus};

use super::store::{JobRecordStore, JobStoreError, RecordFilter};

/// Thresholds for [`QueueDiagnostics`]. Tune per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSettings {
    /// Failed share of recently finished jobs that counts as "high".
    pub error_rate_threshold: f64,
    /// Minimum finished jobs before an error rate is reported at all.
    pub min_sample: usize,
    /// How far back "recently finished" reaches.
    pub window: Duration,
    /// Pending jobs older than this, or running jobs silent for this long, are stale.
    pub stale_after: Duration,
    /// Pending backlog size that counts as stale on its own.
    pub backlog_threshold: usize,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.25,
            min_sample: 10,
            window: Duration::from_secs(24 * 60 * 60),
            stale_after: Duration::from_secs(30 * 60),
            backlog_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub finished_in_window: usize,
    pub failed_in_window: usize,
    pub error_rate: Option<f64>,
    pub high_error_rate: bool,
    pub pending: usize,
    pub oldest_pending_age_secs: Option<i64>,
    /// Running jobs that have not written progress within `stale_after`.
    pub stalled_running: Vec<JobId>,
    pub stale_queue: bool,
}

#[derive(Debug, Clone)]
pub struct QueueDiagnostics {
    settings: DiagnosticsSettings,
}

impl QueueDiagnostics {
    pub fn new(settings: DiagnosticsSettings) -> Self {
        Self { settings }
    }

    pub async fn evaluate(&self, store: &dyn JobRecordStore) -> Result<DiagnosticsReport, JobStoreError> {
        self.evaluate_at(store, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        store: &dyn JobRecordStore,
        now: DateTime<Utc>,
    ) -> Result<DiagnosticsReport, JobStoreError> {
        let window = chrono::Duration::from_std(self.settings.window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let stale = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let mut report = DiagnosticsReport::default();

        for record in store.list(&RecordFilter::default()).await? {
            match record.status {
                JobStatus::Pending => {
                    report.pending += 1;
                    let age = now - record.created_at;
                    let oldest = report.oldest_pending_age_secs.unwrap_or(0);
                    report.oldest_pending_age_secs = Some(oldest.max(age.num_seconds()));
                }
                JobStatus::Running if now - record.updated_at > stale => {
                    report.stalled_running.push(record.version.clone());
                }
                status if status.is_terminal() => {
                    let finished = record.completed_at.unwrap_or(record.updated_at);
                    if now - finished <= window {
                        report.finished_in_window += 1;
                        if status == JobStatus::Failed {
                            report.failed_in_window += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if report.finished_in_window >= self.settings.min_sample.max(1) {
            let rate = report.failed_in_window as f64 / report.finished_in_window as f64;
            report.error_rate = Some(rate);
            report.high_error_rate = rate > self.settings.error_rate_threshold;
        }

        let old_pending = report
            .oldest_pending_age_secs
            .is_some_and(|age| age > stale.num_seconds());
        report.stale_queue = old_pending
            || !report.stalled_running.is_empty()
            || report.pending > self.settings.backlog_threshold;

        if report.high_error_rate {
            warn!(error_rate = ?report.error_rate, failed = report.failed_in_window, "high job error rate");
        }
        if report.stale_queue {
            warn!(
                pending = report.pending,
                stalled = report.stalled_running.len(),
                "job queue looks stale"
            );
        }
        Ok(report)
    }
}
