//! Job orchestration: submission, the per-job run loop and control operations.
//!
//! ## Model
//!
//! - One tokio task per job; chunks within a job are applied sequentially
//! - A semaphore bounds how many jobs run at once
//! - The active map holds one control handle per job id (single writer)
//! - Cancellation and pause are cooperative and honoured at chunk boundaries

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bulkops_core::{ActorId, JobId, JobStatus, SessionId, TransitionError};

use crate::ephemeral::{EphemeralStore, EphemeralStoreError};
use crate::rate_limit::{RateLimitDecision, RateLimitError, RateLimiter, RequestIdentity};

use super::batch::{BatchProcessor, Chunk, DataSource};
use super::broadcast::{DEFAULT_CHANNEL, NotificationBroadcaster};
use super::kind::{BulkJob, ChunkOutcome};
use super::progress::{ProgressSettings, ProgressSnapshot, ProgressTracker, load_snapshot};
use super::resource::{
    ResourceMonitor, ResourceSampler, ResourceThresholds, SamplingSchedule, SysinfoSampler, host_name,
};
use super::retry::{ChunkError, DefaultRetryClassifier, FailureClass, RetryClassifier};
use super::rollback::{RollbackError, RollbackManager, RollbackReport};
use super::store::{JobRecordStore, JobStoreError, RecordFilter, with_timeout};
use super::types::{
    InvalidItem, JobConfiguration, JobExecutionRecord, JobInput, LogLevel, ProgressLogEntry,
    ResourceMetrics, RetryPolicy,
};
use super::validation::{ConfigSchemaStage, PreflightStage, ValidationError, run_preflight};

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Jobs allowed to run at once; further jobs wait in `pending`.
    pub max_concurrent_jobs: usize,
    /// Bound on a single `apply_chunk` call.
    pub chunk_timeout: Duration,
    /// Bound on every record store call.
    pub store_timeout: Duration,
    /// Retries for transient chunk failures.
    pub retry: RetryPolicy,
    pub sample_every_chunks: u32,
    pub sample_interval: Duration,
    /// Consecutive breached samples needed before throttling.
    pub required_breaches: u32,
    /// Default number of log rows returned by `query`.
    pub recent_log_limit: usize,
    /// Recorded on every job for provenance.
    pub environment: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            chunk_timeout: Duration::from_secs(300),
            store_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            sample_every_chunks: 1,
            sample_interval: Duration::from_secs(5),
            required_breaches: 2,
            recent_log_limit: 20,
            environment: "development".to_string(),
        }
    }
}

impl RunnerSettings {
    fn sampling(&self) -> SamplingSchedule {
        SamplingSchedule {
            every_chunks: self.sample_every_chunks,
            interval: self.sample_interval,
            required_breaches: self.required_breaches,
        }
    }
}

/// A request to run a job.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: String,
    pub input: JobInput,
    pub actor_id: ActorId,
    pub session_id: Option<SessionId>,
    pub remote_addr: Option<IpAddr>,
    /// Missing keys are filled from the kind's defaults.
    pub configuration: JobConfiguration,
    /// Caller-chosen identity; generated when absent.
    pub job_id: Option<JobId>,
    pub name: Option<String>,
}

impl SubmitRequest {
    pub fn new(kind: impl Into<String>, input: JobInput, actor_id: ActorId) -> Self {
        Self {
            kind: kind.into(),
            input,
            actor_id,
            session_id: None,
            remote_addr: None,
            configuration: JobConfiguration::new(),
            job_id: None,
            name: None,
        }
    }

    pub fn with_configuration(mut self, configuration: JobConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Synchronous submission failure; no job was started.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown job kind `{0}`")]
    UnknownKind(String),

    #[error("too many submissions; retry in {}s", .time_until_unblock.as_secs())]
    RateLimited { time_until_unblock: Duration },

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job {0} already has an active runner")]
    AlreadyActive(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),

    #[error("runner is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(JobStoreError),
}

/// Control operation refused; names the guard that was violated.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job has no captured compensating data; refusing to roll back")]
    NothingToRollback,

    #[error("job kind `{kind}` is not {capability}")]
    CapabilityMissing {
        kind: String,
        capability: &'static str,
    },

    #[error("job {0} already has an active runner")]
    AlreadyActive(JobId),

    #[error("job {0} has no active runner in this process")]
    NoActiveRunner(JobId),

    #[error("unknown job kind `{0}`")]
    UnknownKind(String),

    #[error("rollback halted at descriptor {sequence}: {message}")]
    RollbackHalted {
        sequence: u64,
        message: String,
        report: RollbackReport,
    },

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Ephemeral(#[from] EphemeralStoreError),
}

impl From<TransitionError> for ControlError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidTransition { from, to } | TransitionError::Terminal { from, to } => {
                ControlError::InvalidTransition { from, to }
            }
        }
    }
}

impl From<RollbackError> for ControlError {
    fn from(err: RollbackError) -> Self {
        match err {
            RollbackError::NothingToRollback => ControlError::NothingToRollback,
            RollbackError::InvalidStatus(from) => ControlError::InvalidTransition {
                from,
                to: JobStatus::RolledBack,
            },
            RollbackError::Transition(t) => t.into(),
            RollbackError::Halted {
                sequence,
                message,
                report,
            } => ControlError::RollbackHalted {
                sequence,
                message,
                report,
            },
        }
    }
}

/// Failure raised by the run loop itself.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("chunk {chunk} still failing after {attempts} retries")]
    RetriesExhausted {
        chunk: u64,
        attempts: u32,
        #[source]
        source: ChunkError,
    },
}

/// Record snapshot plus its most recent progress rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobQuery {
    pub record: JobExecutionRecord,
    pub logs: Vec<ProgressLogEntry>,
}

/// What `recover_interrupted` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records left `running` by a dead process, now `paused`.
    pub paused: Vec<JobId>,
    /// Records left `pending` by a dead process, now queued again.
    pub requeued: Vec<JobId>,
}

pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn ResourceSampler> + Send + Sync>;

#[derive(Clone)]
struct Control {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

impl Control {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct Inner {
    settings: RunnerSettings,
    progress: ProgressSettings,
    store: Arc<dyn JobRecordStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    broadcaster: NotificationBroadcaster,
    rate_limiter: Option<Arc<RateLimiter>>,
    classifier: Arc<dyn RetryClassifier>,
    sampler: SamplerFactory,
    kinds: HashMap<String, Arc<dyn BulkJob>>,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<JobId, Control>>,
    idle: Notify,
    shutdown: CancellationToken,
    hostname: Option<String>,
}

/// Builder for [`JobRunner`].
pub struct JobRunnerBuilder {
    settings: RunnerSettings,
    progress: ProgressSettings,
    store: Arc<dyn JobRecordStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    broadcaster: Option<NotificationBroadcaster>,
    rate_limiter: Option<Arc<RateLimiter>>,
    classifier: Arc<dyn RetryClassifier>,
    sampler: SamplerFactory,
    kinds: HashMap<String, Arc<dyn BulkJob>>,
}

impl JobRunnerBuilder {
    pub fn settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn progress(mut self, progress: ProgressSettings) -> Self {
        self.progress = progress;
        self
    }

    pub fn broadcaster(mut self, broadcaster: NotificationBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn sampler<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ResourceSampler> + Send + Sync + 'static,
    {
        self.sampler = Arc::new(factory);
        self
    }

    /// Register a job kind under its `kind()` name.
    pub fn register(mut self, job: Arc<dyn BulkJob>) -> Self {
        self.kinds.insert(job.kind().to_string(), job);
        self
    }

    pub fn build(self) -> JobRunner {
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| NotificationBroadcaster::in_memory(DEFAULT_CHANNEL).0);
        let mut progress = self.progress;
        progress.store_timeout = self.settings.store_timeout;
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_jobs.max(1)));
        JobRunner {
            inner: Arc::new(Inner {
                settings: self.settings,
                progress,
                store: self.store,
                ephemeral: self.ephemeral,
                broadcaster,
                rate_limiter: self.rate_limiter,
                classifier: self.classifier,
                sampler: self.sampler,
                kinds: self.kinds,
                permits,
                active: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
                hostname: host_name(),
            }),
        }
    }
}

/// Runs bulk jobs on a bounded pool of tokio tasks.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    pub fn builder(store: Arc<dyn JobRecordStore>, ephemeral: Arc<dyn EphemeralStore>) -> JobRunnerBuilder {
        JobRunnerBuilder {
            settings: RunnerSettings::default(),
            progress: ProgressSettings::default(),
            store,
            ephemeral,
            broadcaster: None,
            rate_limiter: None,
            classifier: Arc::new(DefaultRetryClassifier),
            sampler: Arc::new(|| Box::new(SysinfoSampler::new()) as Box<dyn ResourceSampler>),
            kinds: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobRecordStore> {
        &self.inner.store
    }

    pub fn broadcaster(&self) -> &NotificationBroadcaster {
        &self.inner.broadcaster
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.inner.active.lock().unwrap().contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    /// Validate and enqueue a job. Returns once the record exists in `pending`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmitError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let job = inner
            .kinds
            .get(&request.kind)
            .cloned()
            .ok_or_else(|| SubmitError::UnknownKind(request.kind.clone()))?;

        if let Some(limiter) = &inner.rate_limiter {
            let identity = RequestIdentity {
                actor_id: Some(request.actor_id),
                session_id: request.session_id,
                remote_addr: request.remote_addr,
            };
            let action = format!("submit:{}", request.kind);
            if let RateLimitDecision::Blocked { time_until_unblock } = limiter.check(&identity, &action)? {
                warn!(actor_id = %request.actor_id, action = %action, "job submission rate limited");
                return Err(SubmitError::RateLimited { time_until_unblock });
            }
        }

        let configuration = request
            .configuration
            .merged_over(&job.default_configuration());
        let mut stages: Vec<Arc<dyn PreflightStage>> =
            vec![Arc::new(ConfigSchemaStage::new(job.config_schema()))];
        stages.extend(job.preflight());
        run_preflight(&stages, &request.input, &configuration).await?;

        let job_id = request.job_id.unwrap_or_default();
        let control = inner.claim(&job_id).ok_or_else(|| SubmitError::AlreadyActive(job_id.clone()))?;

        let name = request
            .name
            .unwrap_or_else(|| format!("{} {}", request.kind, request.input.describe()));
        let record = JobExecutionRecord::new(
            job_id.clone(),
            name,
            request.kind.clone(),
            request.actor_id,
            request.input,
            configuration,
        )
        .with_provenance(inner.settings.environment.clone(), inner.hostname.clone());

        if let Err(e) = with_timeout(inner.settings.store_timeout, inner.store.insert(&record)).await {
            inner.release(&job_id);
            return Err(match e {
                JobStoreError::AlreadyExists(id) => SubmitError::Duplicate(id),
                other => SubmitError::Store(other),
            });
        }

        info!(job_id = %job_id, kind = %request.kind, actor_id = %request.actor_id, "job submitted");
        let mut tracker = inner.tracker(&job_id);
        tracker.note(&record, LogLevel::Info, "queued", "job accepted").await;

        self.spawn(job, job_id.clone(), control);
        Ok(job_id)
    }

    fn spawn(&self, job: Arc<dyn BulkJob>, job_id: JobId, control: Control) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive(&inner, job, &job_id, &control).await;
            inner.settle(&job_id, &control).await;
        });
    }

    /// Record snapshot plus the last `limit` progress rows (default from settings).
    pub async fn query(&self, job_id: &JobId, limit: Option<usize>) -> Result<JobQuery, ControlError> {
        let record = self.inner.load(job_id).await?;
        let limit = limit.unwrap_or(self.inner.settings.recent_log_limit);
        let logs = with_timeout(
            self.inner.settings.store_timeout,
            self.inner.store.recent_logs(job_id, limit),
        )
        .await?;
        Ok(JobQuery { record, logs })
    }

    /// Latest progress snapshot; falls back to the record once the snapshot has expired.
    pub async fn progress(&self, job_id: &JobId) -> Result<ProgressSnapshot, ControlError> {
        if let Some(snapshot) = load_snapshot(self.inner.ephemeral.as_ref(), job_id).await? {
            return Ok(snapshot);
        }
        let record = self.inner.load(job_id).await?;
        Ok(ProgressSnapshot {
            job_id: record.version.clone(),
            status: record.status,
            processed: record.processed_records,
            total: record.total_records,
            percentage: record.progress_percentage,
            records_per_second: record.metrics.records_per_second,
            estimated_remaining_seconds: None,
            updated_at: record.updated_at,
        })
    }

    /// Ask a running job to park at its next chunk boundary.
    pub async fn pause(&self, job_id: &JobId) -> Result<(), ControlError> {
        let record = self.inner.load(job_id).await?;
        if record.status != JobStatus::Running {
            return Err(ControlError::InvalidTransition {
                from: record.status,
                to: JobStatus::Paused,
            });
        }
        let control = self
            .inner
            .control(job_id)
            .ok_or_else(|| ControlError::NoActiveRunner(job_id.clone()))?;
        control.pause.store(true, Ordering::SeqCst);
        info!(job_id = %job_id, "pause requested");
        Ok(())
    }

    /// Continue a paused job from its checkpoint.
    pub async fn resume(&self, job_id: &JobId) -> Result<(), ControlError> {
        let record = self.inner.load(job_id).await?;
        if record.status != JobStatus::Paused {
            return Err(ControlError::InvalidTransition {
                from: record.status,
                to: JobStatus::Running,
            });
        }
        let job = self.inner.kind_of(&record)?;
        if record.checkpoint_offset > 0 && !job.capabilities().resumable {
            return Err(ControlError::CapabilityMissing {
                kind: record.kind.clone(),
                capability: "resumable",
            });
        }
        let control = self
            .inner
            .claim(job_id)
            .ok_or_else(|| ControlError::AlreadyActive(job_id.clone()))?;
        info!(job_id = %job_id, checkpoint = record.checkpoint_offset, "resume requested");
        self.spawn(job, job_id.clone(), control);
        Ok(())
    }

    /// Cancel a job. Running jobs stop at the next chunk boundary; queued and
    /// paused jobs are cancelled immediately.
    pub async fn cancel(&self, job_id: &JobId) -> Result<(), ControlError> {
        if let Some(control) = self.inner.control(job_id) {
            let record = self.inner.load(job_id).await?;
            if record.status.is_terminal() {
                return Err(ControlError::InvalidTransition {
                    from: record.status,
                    to: JobStatus::Cancelled,
                });
            }
            control.cancel.cancel();
            info!(job_id = %job_id, "cancellation requested");
            return Ok(());
        }
        let _control = self
            .inner
            .claim(job_id)
            .ok_or_else(|| ControlError::AlreadyActive(job_id.clone()))?;
        let result = self
            .inner
            .finalize_idle(job_id, JobStatus::Cancelled, "cancelled while idle")
            .await;
        self.inner.release(job_id);
        result
    }

    /// Replay the job's compensating actions in reverse order.
    pub async fn rollback(&self, job_id: &JobId) -> Result<RollbackReport, ControlError> {
        let _control = self
            .inner
            .claim(job_id)
            .ok_or_else(|| ControlError::AlreadyActive(job_id.clone()))?;
        let result = self.rollback_owned(job_id).await;
        self.inner.release(job_id);
        result
    }

    async fn rollback_owned(&self, job_id: &JobId) -> Result<RollbackReport, ControlError> {
        let inner = &self.inner;
        let mut record = inner.load(job_id).await?;
        let job = inner.kind_of(&record)?;
        let compensator = job.as_rollbackable().ok_or_else(|| ControlError::CapabilityMissing {
            kind: record.kind.clone(),
            capability: "rollbackable",
        })?;

        info!(job_id = %job_id, actions = record.rollback_data.len(), "rollback requested");
        let outcome = RollbackManager::new().rollback(&mut record, compensator).await;
        let mut tracker = inner.tracker(job_id);
        match outcome {
            Ok(report) => {
                inner.persist(&record).await?;
                let message = format!("rolled back {} compensating actions", report.applied.len());
                tracker.finish(&record, "rollback", &message).await;
                Ok(report)
            }
            Err(err @ RollbackError::Halted { .. }) => {
                inner.persist(&record).await?;
                let message = format!("rollback halted: {err}");
                tracker.finish(&record, "rollback", &message).await;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reset a failed or cancelled job and run it again from the start.
    pub async fn restart(&self, job_id: &JobId) -> Result<(), ControlError> {
        let inner = &self.inner;
        let control = inner
            .claim(job_id)
            .ok_or_else(|| ControlError::AlreadyActive(job_id.clone()))?;

        let prepared = async {
            let mut record = inner.load(job_id).await?;
            if !matches!(record.status, JobStatus::Failed | JobStatus::Cancelled) {
                return Err(ControlError::InvalidTransition {
                    from: record.status,
                    to: JobStatus::Pending,
                });
            }
            let job = inner.kind_of(&record)?;
            record.reset_for_restart();
            inner.persist(&record).await?;
            info!(job_id = %job_id, restart_count = record.restart_count, "job restarted");
            Ok(job)
        }
        .await;

        match prepared {
            Ok(job) => {
                self.spawn(job, job_id.clone(), control);
                Ok(())
            }
            Err(e) => {
                inner.release(job_id);
                Err(e)
            }
        }
    }

    /// Reconcile records orphaned by a process crash.
    ///
    /// `running` records with no live runner here move to `paused` for an
    /// operator to resume; `pending` ones are queued again.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport, ControlError> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        let running = with_timeout(
            inner.settings.store_timeout,
            inner.store.list(&RecordFilter::status(JobStatus::Running)),
        )
        .await?;
        for mut record in running {
            let job_id = record.version.clone();
            let Some(_control) = inner.claim(&job_id) else {
                continue;
            };
            let parked = match record.transition(JobStatus::Paused) {
                Ok(()) => {
                    record.status_message =
                        Some("interrupted: runner stopped unexpectedly; resume to continue".to_string());
                    inner.persist(&record).await.map_err(ControlError::from)
                }
                Err(e) => Err(e.into()),
            };
            inner.release(&job_id);
            parked?;
            warn!(job_id = %job_id, checkpoint = record.checkpoint_offset, "recovered interrupted job as paused");
            report.paused.push(job_id);
        }

        let pending = with_timeout(
            inner.settings.store_timeout,
            inner.store.list(&RecordFilter::status(JobStatus::Pending)),
        )
        .await?;
        for record in pending {
            let Ok(job) = inner.kind_of(&record) else {
                warn!(job_id = %record.version, kind = %record.kind, "cannot requeue job of unknown kind");
                continue;
            };
            let Some(control) = inner.claim(&record.version) else {
                continue;
            };
            info!(job_id = %record.version, "requeued orphaned pending job");
            report.requeued.push(record.version.clone());
            self.spawn(job, record.version, control);
        }
        Ok(report)
    }

    /// Wait until no runner holds `job_id`.
    pub async fn wait(&self, job_id: &JobId) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_active(job_id) {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, park running jobs at their next chunk boundary and
    /// wait for every runner to exit. Queued jobs stay `pending`.
    pub async fn shutdown(&self) {
        info!(active = self.active_count(), "runner shutting down");
        self.inner.shutdown.cancel();
        for control in self.inner.active.lock().unwrap().values() {
            control.pause.store(true, Ordering::SeqCst);
        }
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                break;
            }
            notified.await;
        }
        info!("runner stopped");
    }
}

impl Inner {
    /// Take the single-writer slot for `job_id`.
    fn claim(&self, job_id: &JobId) -> Option<Control> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(job_id) {
            return None;
        }
        let control = Control::new();
        if self.shutdown.is_cancelled() {
            control.pause.store(true, Ordering::SeqCst);
        }
        active.insert(job_id.clone(), control.clone());
        Some(control)
    }

    fn release(&self, job_id: &JobId) {
        self.active.lock().unwrap().remove(job_id);
        self.idle.notify_waiters();
    }

    /// Hand the slot back after a run. A cancel that reached the control
    /// after the loop had already parked the job is applied here.
    async fn settle(&self, job_id: &JobId, control: &Control) {
        self.release(job_id);
        if !control.cancel.is_cancelled() {
            return;
        }
        // Someone else owns the job now; their run sees the record as it is.
        let Some(_slot) = self.claim(job_id) else {
            return;
        };
        match self.load(job_id).await {
            Ok(record) if record.status == JobStatus::Paused => {
                if let Err(e) = self
                    .finalize_idle(job_id, JobStatus::Cancelled, "cancelled while paused")
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "late cancellation not applied");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "late cancellation not applied"),
        }
        self.release(job_id);
    }

    fn control(&self, job_id: &JobId) -> Option<Control> {
        self.active.lock().unwrap().get(job_id).cloned()
    }

    fn kind_of(&self, record: &JobExecutionRecord) -> Result<Arc<dyn BulkJob>, ControlError> {
        self.kinds
            .get(&record.kind)
            .cloned()
            .ok_or_else(|| ControlError::UnknownKind(record.kind.clone()))
    }

    fn tracker(&self, job_id: &JobId) -> ProgressTracker {
        ProgressTracker::new(
            job_id.clone(),
            self.progress.clone(),
            self.ephemeral.clone(),
            self.store.clone(),
            self.broadcaster.clone(),
        )
    }

    async fn load(&self, job_id: &JobId) -> Result<JobExecutionRecord, JobStoreError> {
        with_timeout(self.settings.store_timeout, self.store.get(job_id))
            .await?
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))
    }

    async fn persist(&self, record: &JobExecutionRecord) -> Result<(), JobStoreError> {
        with_timeout(self.settings.store_timeout, self.store.update(record)).await
    }

    /// Move a job with no running loop straight to `to`.
    async fn finalize_idle(&self, job_id: &JobId, to: JobStatus, message: &str) -> Result<(), ControlError> {
        let mut record = self.load(job_id).await?;
        record.transition(to)?;
        record.status_message = Some(message.to_string());
        self.persist(&record).await?;
        info!(job_id = %job_id, status = %to, "{message}");
        self.tracker(job_id).finish(&record, phase_for(to), message).await;
        Ok(())
    }

    /// Transition, persist, and publish the final update of this run.
    async fn conclude(
        &self,
        record: &mut JobExecutionRecord,
        tracker: &mut ProgressTracker,
        to: JobStatus,
        message: String,
    ) -> Result<(), JobStoreError> {
        if let Err(e) = record.transition(to) {
            error!(job_id = %record.version, error = %e, "refusing invalid transition");
            return Ok(());
        }
        record.status_message = Some(message.clone());
        self.persist(record).await?;
        info!(job_id = %record.version, status = %to, processed = record.processed_records, "{message}");
        tracker.finish(record, phase_for(to), &message).await;
        Ok(())
    }

    async fn fail(
        &self,
        record: &mut JobExecutionRecord,
        tracker: &mut ProgressTracker,
        err: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Result<(), JobStoreError> {
        error!(job_id = %record.version, error = %err, "job failed");
        record.record_error(err);
        let message = format!("failed: {err}");
        self.conclude(record, tracker, JobStatus::Failed, message).await
    }
}

fn phase_for(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Completed => "finished",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Paused => "paused",
        JobStatus::RolledBack | JobStatus::PartiallyRolledBack => "rollback",
        JobStatus::Pending | JobStatus::Running => "batch-apply",
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Wait for a worker slot, then run the job.
async fn drive(inner: &Arc<Inner>, job: Arc<dyn BulkJob>, job_id: &JobId, control: &Control) {
    let permit = tokio::select! {
        biased;
        _ = control.cancel.cancelled() => None,
        _ = inner.shutdown.cancelled() => None,
        permit = inner.permits.clone().acquire_owned() => permit.ok(),
    };

    let Some(_permit) = permit else {
        if control.cancel.is_cancelled() {
            if let Err(e) = inner
                .finalize_idle(job_id, JobStatus::Cancelled, "cancelled before start")
                .await
            {
                error!(job_id = %job_id, error = %e, "failed to cancel queued job");
            }
        } else {
            debug!(job_id = %job_id, "runner stopped before the job started");
        }
        return;
    };

    if let Err(e) = execute(inner, job, job_id, control).await {
        // The record keeps its last persisted state; `recover_interrupted` picks it up.
        error!(job_id = %job_id, error = %e, "job runner aborted on store failure");
    }
}

enum Interrupted {
    Cancelled,
}

async fn open_source(
    inner: &Inner,
    job: &dyn BulkJob,
    record: &JobExecutionRecord,
    control: &Control,
) -> Result<Result<Box<dyn DataSource>, ChunkError>, Interrupted> {
    let mut attempt = 0u32;
    loop {
        let opened = if record.checkpoint_offset > 0 {
            match job.as_resumable() {
                Some(r) => {
                    r.reopen(&record.input, &record.configuration, record.checkpoint_offset)
                        .await
                }
                None => Err(ChunkError::fatal(format!(
                    "job kind `{}` cannot reopen at a checkpoint",
                    record.kind
                ))),
            }
        } else {
            job.open(&record.input, &record.configuration).await
        };
        match opened {
            Ok(source) => return Ok(Ok(source)),
            Err(e) => match inner.classifier.classify(&e) {
                FailureClass::Retryable if inner.settings.retry.should_retry(attempt) => {
                    attempt += 1;
                    let delay = inner.settings.retry.delay_for_attempt(attempt);
                    warn!(job_id = %record.version, attempt, ?delay, error = %e, "retrying source open");
                    if !backoff(delay, &control.cancel).await {
                        return Err(Interrupted::Cancelled);
                    }
                }
                _ => return Ok(Err(e)),
            },
        }
    }
}

async fn read_chunk(
    inner: &Inner,
    batches: &mut BatchProcessor,
    source: &mut dyn DataSource,
    record: &JobExecutionRecord,
    control: &Control,
) -> Result<Result<Option<Chunk>, ChunkError>, Interrupted> {
    let mut attempt = 0u32;
    loop {
        match batches.next_chunk(source).await {
            Ok(chunk) => return Ok(Ok(chunk)),
            Err(e) => match inner.classifier.classify(&e) {
                FailureClass::Retryable if inner.settings.retry.should_retry(attempt) => {
                    attempt += 1;
                    let delay = inner.settings.retry.delay_for_attempt(attempt);
                    warn!(job_id = %record.version, attempt, ?delay, error = %e, "retrying source read");
                    if !backoff(delay, &control.cancel).await {
                        return Err(Interrupted::Cancelled);
                    }
                }
                _ => return Ok(Err(e)),
            },
        }
    }
}

/// The per-job run loop. Returns `Err` only when the record store fails.
async fn execute(
    inner: &Arc<Inner>,
    job: Arc<dyn BulkJob>,
    job_id: &JobId,
    control: &Control,
) -> Result<(), JobStoreError> {
    let mut record = inner.load(job_id).await?;
    let mut tracker = inner.tracker(job_id);
    let resuming = match record.status {
        JobStatus::Pending => false,
        JobStatus::Paused => true,
        other => {
            warn!(job_id = %job_id, status = %other, "job is not runnable");
            return Ok(());
        }
    };

    if !resuming {
        if let Err(e) = job.config_schema().validate(&record.configuration) {
            return inner.fail(&mut record, &mut tracker, &e).await;
        }
    }

    let mut source = match open_source(inner, job.as_ref(), &record, control).await {
        Ok(Ok(source)) => source,
        Ok(Err(e)) if resuming => {
            error!(job_id = %job_id, error = %e, "cannot reopen source; job stays paused");
            record.record_error(&e);
            let message = format!("resume failed: {e}");
            record.status_message = Some(message.clone());
            inner.persist(&record).await?;
            tracker.finish(&record, "paused", &message).await;
            return Ok(());
        }
        Ok(Err(e)) => return inner.fail(&mut record, &mut tracker, &e).await,
        Err(Interrupted::Cancelled) => {
            let message = "cancelled before start".to_string();
            return inner.conclude(&mut record, &mut tracker, JobStatus::Cancelled, message).await;
        }
    };

    record.set_total(source.total_hint());
    if let Err(e) = record.transition(JobStatus::Running) {
        error!(job_id = %job_id, error = %e, "cannot start job");
        return Ok(());
    }
    record.status_message = None;
    record.process_id = std::process::id();
    inner.persist(&record).await?;
    let (phase, message) = if resuming {
        ("resume", format!("resumed at offset {}", record.checkpoint_offset))
    } else {
        ("initialization", format!("started; {} records expected", record.total_records))
    };
    info!(job_id = %job_id, kind = %record.kind, total = record.total_records, "{message}");
    tracker.begin(&record, phase, &message).await;

    let mut batches = BatchProcessor::from_configuration(&record.configuration)
        .resume_at(record.current_batch_number, record.checkpoint_offset)
        .with_current_size(record.current_batch_size);
    let mut monitor = ResourceMonitor::new(
        (inner.sampler)(),
        ResourceThresholds::from_configuration(&record.configuration),
        inner.settings.sampling(),
    );
    let rollback = RollbackManager::new();

    loop {
        if control.cancel.is_cancelled() {
            let message = format!("cancelled after {} records", record.processed_records);
            return inner.conclude(&mut record, &mut tracker, JobStatus::Cancelled, message).await;
        }
        if control.pause.load(Ordering::SeqCst) {
            let message = format!("paused at offset {}", record.checkpoint_offset);
            return inner.conclude(&mut record, &mut tracker, JobStatus::Paused, message).await;
        }

        let chunk = match read_chunk(inner, &mut batches, source.as_mut(), &record, control).await {
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return inner.fail(&mut record, &mut tracker, &e).await,
            Err(Interrupted::Cancelled) => {
                let message = format!("cancelled after {} records", record.processed_records);
                return inner.conclude(&mut record, &mut tracker, JobStatus::Cancelled, message).await;
            }
        };

        let started = Instant::now();
        let mut working = chunk.clone();
        let mut invalid: Vec<InvalidItem> = chunk.rejected.clone();
        let mut attempt = 0u32;

        let outcome = loop {
            if working.items.is_empty() {
                break ChunkOutcome::applied();
            }
            let limit = inner.settings.chunk_timeout;
            let result = match tokio::time::timeout(limit, job.apply_chunk(&working, &record.configuration)).await {
                Ok(result) => result,
                Err(_) => Err(ChunkError::Timeout(limit)),
            };
            let err = match result {
                Ok(outcome) => break outcome,
                Err(err) => err,
            };

            match inner.classifier.classify(&err) {
                FailureClass::PartialContinue => {
                    if let ChunkError::ItemInvalid { index, reason } = &err {
                        if *index < working.items.len() {
                            let item = working.items.remove(*index);
                            debug!(job_id = %job_id, chunk = chunk.number, position = item.position, reason = %reason, "dropping invalid item");
                            invalid.push(InvalidItem::new(item.position, reason.clone()).with_item(item.value));
                            continue;
                        }
                    }
                    return inner.fail(&mut record, &mut tracker, &err).await;
                }
                FailureClass::Retryable if inner.settings.retry.should_retry(attempt) => {
                    attempt += 1;
                    record.retry_count += 1;
                    let delay = inner.settings.retry.delay_for_attempt(attempt);
                    warn!(job_id = %job_id, chunk = chunk.number, attempt, ?delay, error = %err, "retrying chunk");
                    let note = format!(
                        "chunk {} attempt {attempt} failed: {err}; retrying in {}ms",
                        chunk.number,
                        delay.as_millis()
                    );
                    inner.persist(&record).await?;
                    tracker.note(&record, LogLevel::Warn, "retry", &note).await;
                    if !backoff(delay, &control.cancel).await {
                        let message = format!("cancelled after {} records", record.processed_records);
                        return inner.conclude(&mut record, &mut tracker, JobStatus::Cancelled, message).await;
                    }
                }
                FailureClass::Retryable => {
                    let exhausted = RunError::RetriesExhausted {
                        chunk: chunk.number,
                        attempts: attempt,
                        source: err,
                    };
                    return inner.fail(&mut record, &mut tracker, &exhausted).await;
                }
                FailureClass::FatalDiscard => return inner.fail(&mut record, &mut tracker, &err).await,
            }
        };

        if !outcome.compensations.is_empty() {
            rollback.capture(&mut record, chunk.number, outcome.compensations);
        }
        invalid.extend(outcome.invalid_items);
        let invalid_count = invalid.len();
        record.invalid_items.extend(invalid);
        record.record_chunk(chunk.len() as u64, chunk.number, batches.batch_size());

        let throttle = monitor.on_chunk_completed();
        let rps = tracker.records_per_second();
        record.metrics = match monitor.last_sample() {
            Some(sample) => sample.to_metrics(rps),
            None => ResourceMetrics {
                records_per_second: rps,
                ..Default::default()
            },
        };
        inner.persist(&record).await?;

        let message = if invalid_count > 0 {
            format!("chunk {} applied ({} items, {invalid_count} invalid)", chunk.number, chunk.len())
        } else {
            format!("chunk {} applied ({} items)", chunk.number, chunk.len())
        };
        tracker
            .chunk_applied(&record, chunk.len() as u64, started.elapsed(), &message)
            .await;

        if throttle {
            if batches.shrink() {
                record.current_batch_size = batches.batch_size();
                let note = format!("resource pressure; batch size now {}", batches.batch_size());
                tracker.note(&record, LogLevel::Warn, "throttle", &note).await;
            } else {
                warn!(job_id = %job_id, batch_size = batches.batch_size(), "sustained resource pressure at minimum batch size");
                let message = "paused: sustained resource pressure at minimum batch size; resume when capacity allows".to_string();
                return inner.conclude(&mut record, &mut tracker, JobStatus::Paused, message).await;
            }
        }
    }

    let message = if record.invalid_items.is_empty() {
        format!("completed: {} records", record.processed_records)
    } else {
        format!(
            "completed: {} records, {} invalid",
            record.processed_records,
            record.invalid_items.len()
        )
    };
    inner.conclude(&mut record, &mut tracker, JobStatus::Completed, message).await
}
