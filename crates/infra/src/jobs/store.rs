//! Durable job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bulkops_core::{JobId, JobStatus};

use super::types::{JobExecutionRecord, ProgressLogEntry};

/// Record store abstraction.
///
/// Shared by every worker; implementations must support concurrent access
/// across unrelated jobs. Writes to a single job's record are serialized by
/// the runner that owns it.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError>;

    /// Get a record by id.
    async fn get(&self, job_id: &JobId) -> Result<Option<JobExecutionRecord>, JobStoreError>;

    /// Replace an existing record.
    async fn update(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError>;

    /// List records matching `filter`, oldest first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobExecutionRecord>, JobStoreError>;

    /// Append a progress row and return it with its assigned sequence.
    ///
    /// Within one attempt, rows must arrive in non-decreasing
    /// `current_batch_number`; a restart starts a new attempt.
    async fn append_log(&self, entry: ProgressLogEntry) -> Result<ProgressLogEntry, JobStoreError>;

    /// Set the broadcast marker on a previously written row.
    async fn mark_broadcasted(
        &self,
        job_id: &JobId,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Most recent `limit` rows for a job, in write order.
    async fn recent_logs(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ProgressLogEntry>, JobStoreError>;

    /// Record counts by status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("progress log out of order for {job_id}: batch {got} after {last}")]
    OutOfOrder { job_id: JobId, last: u64, got: u64 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store operation timed out")]
    Timeout,
}

/// Bound a store call so a stalled backend cannot wedge a worker.
pub async fn with_timeout<T, F>(limit: std::time::Duration, fut: F) -> Result<T, JobStoreError>
where
    F: std::future::Future<Output = Result<T, JobStoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| JobStoreError::Timeout)?
}

/// Selection for [`JobRecordStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<String>,
    /// Only records last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// 0 means no limit.
    pub limit: usize,
}

impl RecordFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, record: &JobExecutionRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.kind.as_deref().is_none_or(|k| record.kind == k)
            && self.updated_before.is_none_or(|t| record.updated_at < t)
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rolled_back: usize,
    pub partially_rolled_back: usize,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Paused => &mut self.paused,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
            JobStatus::RolledBack => &mut self.rolled_back,
            JobStatus::PartiallyRolledBack => &mut self.partially_rolled_back,
        };
        *slot += n;
    }

    /// Jobs that reached a finished outcome (used for error rates).
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.rolled_back + self.partially_rolled_back
    }
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    records: RwLock<HashMap<JobId, JobExecutionRecord>>,
    logs: RwLock<HashMap<JobId, Vec<ProgressLogEntry>>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every progress row written for a job (test inspection).
    pub fn all_logs(&self, job_id: &JobId) -> Vec<ProgressLogEntry> {
        self.logs
            .read()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn insert(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.version) {
            return Err(JobStoreError::AlreadyExists(record.version.clone()));
        }
        records.insert(record.version.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobExecutionRecord>, JobStoreError> {
        Ok(self.records.read().unwrap().get(job_id).cloned())
    }

    async fn update(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        let mut records = self.records.write().unwrap();
        let Some(slot) = records.get_mut(&record.version) else {
            return Err(JobStoreError::NotFound(record.version.clone()));
        };
        *slot = record.clone();
        Ok(())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobExecutionRecord>, JobStoreError> {
        let records = self.records.read().unwrap();
        let mut result: Vec<_> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.version.cmp(&b.version)));
        if filter.limit > 0 {
            result.truncate(filter.limit);
        }
        Ok(result)
    }

    async fn append_log(&self, mut entry: ProgressLogEntry) -> Result<ProgressLogEntry, JobStoreError> {
        let mut logs = self.logs.write().unwrap();
        let rows = logs.entry(entry.job_id.clone()).or_default();
        if let Some(last) = rows.last() {
            let regressed = entry.attempt < last.attempt
                || (entry.attempt == last.attempt
                    && entry.current_batch_number < last.current_batch_number);
            if regressed {
                return Err(JobStoreError::OutOfOrder {
                    job_id: entry.job_id,
                    last: last.current_batch_number,
                    got: entry.current_batch_number,
                });
            }
        }
        entry.sequence = rows.len() as u64;
        rows.push(entry.clone());
        Ok(entry)
    }

    async fn mark_broadcasted(
        &self,
        job_id: &JobId,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut logs = self.logs.write().unwrap();
        let row = logs
            .get_mut(job_id)
            .and_then(|rows| rows.get_mut(sequence as usize))
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
        row.broadcasted = true;
        row.broadcasted_at = Some(at);
        Ok(())
    }

    async fn recent_logs(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ProgressLogEntry>, JobStoreError> {
        let logs = self.logs.read().unwrap();
        let rows = logs.get(job_id).map(Vec::as_slice).unwrap_or_default();
        let skip = rows.len().saturating_sub(limit);
        Ok(rows[skip..].to_vec())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let records = self.records.read().unwrap();
        let mut stats = JobStats::default();
        for r in records.values() {
            stats.count(r.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    async fn insert(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobExecutionRecord>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        (**self).update(record).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobExecutionRecord>, JobStoreError> {
        (**self).list(filter).await
    }

    async fn append_log(&self, entry: ProgressLogEntry) -> Result<ProgressLogEntry, JobStoreError> {
        (**self).append_log(entry).await
    }

    async fn mark_broadcasted(
        &self,
        job_id: &JobId,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).mark_broadcasted(job_id, sequence, at).await
    }

    async fn recent_logs(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<ProgressLogEntry>, JobStoreError> {
        (**self).recent_logs(job_id, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkops_core::ActorId;

    use crate::jobs::types::{JobConfiguration, JobInput, LogLevel};

    fn record(kind: &str) -> JobExecutionRecord {
        JobExecutionRecord::new(
            JobId::new(),
            "test",
            kind,
            ActorId::new(),
            JobInput::Inline { items: vec![] },
            JobConfiguration::defaults(),
        )
    }

    fn entry(job_id: &JobId, batch: u64) -> ProgressLogEntry {
        ProgressLogEntry {
            job_id: job_id.clone(),
            sequence: 0,
            attempt: 0,
            phase: "batch-apply".into(),
            progress_percentage: None,
            processed_records: batch * 10,
            current_batch_size: 10,
            current_batch_number: batch,
            message: format!("chunk {batch}"),
            log_level: LogLevel::Info,
            records_per_second: None,
            estimated_remaining_seconds: None,
            broadcasted: false,
            broadcasted_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryJobRecordStore::new();
        let r = record("csv_import");
        store.insert(&r).await.unwrap();
        assert!(matches!(
            store.insert(&r).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = InMemoryJobRecordStore::new();
        let mut r = record("csv_import");
        assert!(matches!(store.update(&r).await, Err(JobStoreError::NotFound(_))));

        store.insert(&r).await.unwrap();
        r.transition(JobStatus::Running).unwrap();
        store.update(&r).await.unwrap();
        assert_eq!(
            store.get(&r.version).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn list_filters_by_status_and_kind() {
        let store = InMemoryJobRecordStore::arc();
        let mut a = record("csv_import");
        a.transition(JobStatus::Running).unwrap();
        let b = record("csv_import");
        let c = record("migration");
        for r in [&a, &b, &c] {
            store.insert(r).await.unwrap();
        }

        let running = store.list(&RecordFilter::status(JobStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);

        let imports = store
            .list(&RecordFilter {
                kind: Some("csv_import".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(imports.len(), 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
    }

    #[tokio::test]
    async fn logs_are_sequenced_and_ordered_by_batch() {
        let store = InMemoryJobRecordStore::new();
        let id = JobId::new();
        for batch in [1, 2, 2, 3] {
            store.append_log(entry(&id, batch)).await.unwrap();
        }
        assert!(matches!(
            store.append_log(entry(&id, 1)).await,
            Err(JobStoreError::OutOfOrder { last: 3, got: 1, .. })
        ));

        let mut restarted = entry(&id, 1);
        restarted.attempt = 1;
        store.append_log(restarted).await.unwrap();

        let recent = store.recent_logs(&id, 2).await.unwrap();
        assert_eq!(recent.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn broadcast_marker_is_the_only_mutation() {
        let store = InMemoryJobRecordStore::new();
        let id = JobId::new();
        let written = store.append_log(entry(&id, 1)).await.unwrap();
        let at = Utc::now();
        store.mark_broadcasted(&id, written.sequence, at).await.unwrap();

        let after = store.all_logs(&id).remove(0);
        assert!(after.broadcasted);
        assert_eq!(after.broadcasted_at, Some(at));
        assert_eq!(after.message, written.message);
        assert!(store.mark_broadcasted(&id, 9, at).await.is_err());
    }
}
