//! Progress accounting: ephemeral snapshots, progress log rows, throttled broadcasts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use bulkops_core::{JobId, JobStatus};

use crate::ephemeral::EphemeralStore;

use super::broadcast::{JobEvent, NotificationBroadcaster};
use super::store::{JobRecordStore, with_timeout};
use super::types::{JobExecutionRecord, LogLevel, ProgressLogEntry};

/// Progress tracking knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    /// Snapshot TTL while the job is active.
    pub running_ttl: Duration,
    /// Snapshot TTL once the job has stopped, so late readers see the outcome.
    pub terminal_ttl: Duration,
    /// Broadcast after this many chunks...
    pub broadcast_every_chunks: u32,
    /// ...or after this much time, whichever comes first.
    pub broadcast_interval: Duration,
    /// Chunks in the throughput moving average.
    pub throughput_window: usize,
    /// Bound on every store write.
    pub store_timeout: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            running_ttl: Duration::from_secs(60 * 60),
            terminal_ttl: Duration::from_secs(24 * 60 * 60),
            broadcast_every_chunks: 10,
            broadcast_interval: Duration::from_secs(5),
            throughput_window: 5,
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Value stored under `progress:{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub processed: u64,
    pub total: u64,
    pub percentage: Option<f64>,
    pub records_per_second: Option<f64>,
    pub estimated_remaining_seconds: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

pub fn snapshot_key(job_id: &JobId) -> String {
    format!("progress:{job_id}")
}

/// Trailing moving average over the last K chunks.
#[derive(Debug, Clone)]
struct Throughput {
    window: usize,
    samples: VecDeque<(u64, Duration)>,
}

impl Throughput {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, count: u64, elapsed: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((count, elapsed));
    }

    fn records_per_second(&self) -> Option<f64> {
        let count: u64 = self.samples.iter().map(|(c, _)| c).sum();
        let secs: f64 = self.samples.iter().map(|(_, d)| d.as_secs_f64()).sum();
        (secs > 0.0 && count > 0).then(|| count as f64 / secs)
    }
}

/// `(total - processed) / throughput`; `None` while either is unknown.
pub fn estimate_remaining(processed: u64, total: u64, records_per_second: Option<f64>) -> Option<f64> {
    let rps = records_per_second.filter(|r| *r > 0.0)?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(processed) as f64 / rps)
}

/// Per-job progress tracker owned by the job's runner.
pub struct ProgressTracker {
    job_id: JobId,
    settings: ProgressSettings,
    ephemeral: Arc<dyn EphemeralStore>,
    store: Arc<dyn JobRecordStore>,
    broadcaster: NotificationBroadcaster,
    throughput: Throughput,
    chunks_since_broadcast: u32,
    last_broadcast_at: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(
        job_id: JobId,
        settings: ProgressSettings,
        ephemeral: Arc<dyn EphemeralStore>,
        store: Arc<dyn JobRecordStore>,
        broadcaster: NotificationBroadcaster,
    ) -> Self {
        let throughput = Throughput::new(settings.throughput_window);
        Self {
            job_id,
            settings,
            ephemeral,
            store,
            broadcaster,
            throughput,
            chunks_since_broadcast: 0,
            last_broadcast_at: None,
        }
    }

    pub fn records_per_second(&self) -> Option<f64> {
        self.throughput.records_per_second()
    }

    /// First update of a run; always broadcast.
    pub async fn begin(&mut self, record: &JobExecutionRecord, phase: &str, message: &str) {
        let entry = self.write(record, phase, message, LogLevel::Info).await;
        let event = self.broadcaster.progress_event(record, phase, message);
        self.broadcast(event, entry).await;
    }

    /// Account for one applied chunk; broadcast when the throttle window allows.
    pub async fn chunk_applied(
        &mut self,
        record: &JobExecutionRecord,
        count: u64,
        elapsed: Duration,
        message: &str,
    ) {
        self.throughput.push(count, elapsed);
        let entry = self.write(record, "batch-apply", message, LogLevel::Info).await;

        self.chunks_since_broadcast += 1;
        let by_count = self.chunks_since_broadcast >= self.settings.broadcast_every_chunks.max(1);
        let by_time = self
            .last_broadcast_at
            .is_none_or(|at| at.elapsed() >= self.settings.broadcast_interval);
        if by_count || by_time {
            let event = self.broadcaster.progress_event(record, "batch-apply", message);
            self.broadcast(event, entry).await;
        } else {
            debug!(job_id = %self.job_id, "progress broadcast throttled");
        }
    }

    /// Log row without a broadcast (retries, shrinks, rejected items).
    pub async fn note(&mut self, record: &JobExecutionRecord, level: LogLevel, phase: &str, message: &str) {
        self.write(record, phase, message, level).await;
    }

    /// Last update of a run (terminal, or parked in `paused`); always broadcast.
    pub async fn finish(&mut self, record: &JobExecutionRecord, phase: &str, message: &str) {
        let level = match record.status {
            JobStatus::Failed | JobStatus::PartiallyRolledBack => LogLevel::Error,
            JobStatus::Cancelled | JobStatus::Paused => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        let entry = self.write(record, phase, message, level).await;
        let event = self.broadcaster.status_event(record, phase, message);
        self.broadcast(event, entry).await;
    }

    async fn write(
        &self,
        record: &JobExecutionRecord,
        phase: &str,
        message: &str,
        level: LogLevel,
    ) -> Option<ProgressLogEntry> {
        let rps = self.throughput.records_per_second();
        let eta = estimate_remaining(record.processed_records, record.total_records, rps);

        let snapshot = ProgressSnapshot {
            job_id: self.job_id.clone(),
            status: record.status,
            processed: record.processed_records,
            total: record.total_records,
            percentage: record.progress_percentage,
            records_per_second: rps,
            estimated_remaining_seconds: eta,
            updated_at: Utc::now(),
        };
        let ttl = if record.status.is_active() {
            self.settings.running_ttl
        } else {
            self.settings.terminal_ttl
        };
        self.put_snapshot(&snapshot, ttl).await;

        let entry = ProgressLogEntry {
            job_id: self.job_id.clone(),
            sequence: 0,
            attempt: record.restart_count,
            phase: phase.to_string(),
            progress_percentage: record.progress_percentage,
            processed_records: record.processed_records,
            current_batch_size: record.current_batch_size,
            current_batch_number: record.current_batch_number,
            message: message.to_string(),
            log_level: level,
            records_per_second: rps,
            estimated_remaining_seconds: eta,
            broadcasted: false,
            broadcasted_at: None,
            created_at: Utc::now(),
        };
        match with_timeout(self.settings.store_timeout, self.store.append_log(entry)).await {
            Ok(written) => Some(written),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to append progress log row");
                None
            }
        }
    }

    async fn put_snapshot(&self, snapshot: &ProgressSnapshot, ttl: Duration) {
        let value = match serde_json::to_value(snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to serialize progress snapshot");
                return;
            }
        };
        let key = snapshot_key(&self.job_id);
        match tokio::time::timeout(self.settings.store_timeout, self.ephemeral.put(&key, value, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = %self.job_id, error = %e, "progress snapshot write failed"),
            Err(_) => warn!(job_id = %self.job_id, "progress snapshot write timed out"),
        }
    }

    async fn broadcast(&mut self, event: JobEvent, entry: Option<ProgressLogEntry>) {
        self.chunks_since_broadcast = 0;
        self.last_broadcast_at = Some(Instant::now());
        if !self.broadcaster.publish(event) {
            return;
        }
        if let Some(entry) = entry {
            let mark = self.store.mark_broadcasted(&self.job_id, entry.sequence, Utc::now());
            if let Err(e) = with_timeout(self.settings.store_timeout, mark).await {
                warn!(job_id = %self.job_id, error = %e, "failed to mark progress row broadcasted");
            }
        }
    }
}

/// Read the latest snapshot for a job, if it has not expired.
pub async fn load_snapshot(
    ephemeral: &dyn EphemeralStore,
    job_id: &JobId,
) -> Result<Option<ProgressSnapshot>, crate::ephemeral::EphemeralStoreError> {
    let Some(value) = ephemeral.get(&snapshot_key(job_id)).await? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| crate::ephemeral::EphemeralStoreError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkops_core::ActorId;
    use bulkops_events::{EventBus, InMemoryEventBus};

    use crate::ephemeral::InMemoryEphemeralStore;
    use crate::jobs::store::InMemoryJobRecordStore;
    use crate::jobs::types::{JobConfiguration, JobInput};

    struct Fixture {
        tracker: ProgressTracker,
        ephemeral: Arc<InMemoryEphemeralStore>,
        store: Arc<InMemoryJobRecordStore>,
        bus: Arc<InMemoryEventBus<JobEvent>>,
        record: JobExecutionRecord,
    }

    fn fixture(every: u32) -> Fixture {
        let ephemeral = InMemoryEphemeralStore::arc();
        let store = InMemoryJobRecordStore::arc();
        let (broadcaster, bus) = NotificationBroadcaster::in_memory("ops");
        let mut record = JobExecutionRecord::new(
            JobId::new(),
            "t",
            "k",
            ActorId::new(),
            JobInput::Inline { items: vec![] },
            JobConfiguration::defaults(),
        );
        record.transition(JobStatus::Running).unwrap();
        record.set_total(Some(100));
        let tracker = ProgressTracker::new(
            record.version.clone(),
            ProgressSettings {
                broadcast_every_chunks: every,
                broadcast_interval: Duration::from_secs(3600),
                throughput_window: 2,
                ..Default::default()
            },
            ephemeral.clone(),
            store.clone(),
            broadcaster,
        );
        Fixture {
            tracker,
            ephemeral,
            store,
            bus,
            record,
        }
    }

    #[test]
    fn eta_needs_total_and_throughput() {
        assert_eq!(estimate_remaining(10, 0, Some(5.0)), None);
        assert_eq!(estimate_remaining(10, 100, None), None);
        assert_eq!(estimate_remaining(10, 100, Some(0.0)), None);
        assert_eq!(estimate_remaining(10, 100, Some(9.0)), Some(10.0));
    }

    #[test]
    fn throughput_is_a_trailing_window() {
        let mut t = Throughput::new(2);
        t.push(100, Duration::from_secs(100));
        t.push(10, Duration::from_secs(1));
        t.push(10, Duration::from_secs(1));
        assert_eq!(t.records_per_second(), Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn first_and_last_updates_always_broadcast() {
        let mut f = fixture(3);
        let sub = f.bus.subscribe();
        f.tracker.begin(&f.record, "initialization", "started").await;

        for n in 1..=4u64 {
            f.record.record_chunk(10, n, 10);
            f.tracker
                .chunk_applied(&f.record, 10, Duration::from_secs(1), &format!("chunk {n}"))
                .await;
        }
        f.record.transition(JobStatus::Completed).unwrap();
        f.tracker.finish(&f.record, "finished", "done").await;

        let events = sub.drain();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["started", "chunk 3", "done"]);
        assert_eq!(events.last().unwrap().status, Some(JobStatus::Completed));

        let logs = f.store.all_logs(&f.record.version);
        assert_eq!(logs.len(), 6);
        assert_eq!(
            logs.iter().filter(|l| l.broadcasted).count(),
            events.len(),
            "broadcast marker tracks what was pushed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_ttl_extends_when_terminal() {
        let mut f = fixture(1);
        f.tracker.begin(&f.record, "initialization", "started").await;
        let key = snapshot_key(&f.record.version);
        assert!(f.ephemeral.ttl(&key).unwrap() <= Duration::from_secs(3600));

        f.record.transition(JobStatus::Cancelled).unwrap();
        f.tracker.finish(&f.record, "finished", "cancelled").await;
        assert!(f.ephemeral.ttl(&key).unwrap() > Duration::from_secs(3600));

        let snap = load_snapshot(f.ephemeral.as_ref(), &f.record.version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert_eq!(snap.total, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_expires() {
        let mut f = fixture(1);
        f.tracker.begin(&f.record, "initialization", "started").await;
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(load_snapshot(f.ephemeral.as_ref(), &f.record.version)
            .await
            .unwrap()
            .is_none());
    }
}
