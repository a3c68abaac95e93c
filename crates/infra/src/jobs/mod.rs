//! Bulk-operation execution: long, resumable, resource-sensitive jobs.
//!
//! ## Design
//!
//! - A job is a [`JobExecutionRecord`] plus a registered [`BulkJob`] kind
//! - One runner per job id; chunks are applied sequentially
//! - Failures are classified as retryable, fatal or per-item
//! - Progress goes to an expiring snapshot, an append-only log and a broadcast channel
//! - Mutations capture compensating actions for best-effort rollback
//!
//! ## Components
//!
//! - `JobRunner`: submission, the run loop and control operations
//! - `BatchProcessor` / `ResourceMonitor`: adaptive chunking
//! - `ProgressTracker` / `NotificationBroadcaster`: progress reporting
//! - `RetryClassifier`, `RollbackManager`, `ConfigSchema`, `FileGate`
//! - `JobRecordStore`: durable records (in-memory or Postgres)

pub mod batch;
pub mod broadcast;
pub mod diagnostics;
pub mod import;
pub mod kind;
pub mod postgres;
pub mod progress;
pub mod resource;
pub mod retry;
pub mod rollback;
pub mod runner;
pub mod store;
pub mod types;
pub mod validation;

pub use batch::{BatchProcessor, Chunk, DataSource, SourceBatch, SourceItem, VecSource};
pub use broadcast::{JobEvent, JobEventSink, NotificationBroadcaster, DEFAULT_CHANNEL};
pub use diagnostics::{DiagnosticsReport, DiagnosticsSettings, QueueDiagnostics};
pub use import::{CsvFileSource, CsvImportJob, ImportSink, CSV_IMPORT_KIND};
pub use kind::{BulkJob, Capabilities, ChunkOutcome, Resumable};
pub use postgres::PostgresJobRecordStore;
pub use progress::{ProgressSettings, ProgressSnapshot, ProgressTracker};
pub use resource::{ResourceMonitor, ResourceSampler, ResourceThresholds, SysinfoSampler};
pub use retry::{ChunkError, DefaultRetryClassifier, FailureClass, RetryClassifier};
pub use rollback::{
    CompensatingAction, Compensation, CompensationError, RollbackError, RollbackManager,
    RollbackReport, Rollbackable,
};
pub use runner::{
    ControlError, JobQuery, JobRunner, JobRunnerBuilder, RecoveryReport, RunnerSettings,
    SubmitError, SubmitRequest,
};
pub use store::{InMemoryJobRecordStore, JobRecordStore, JobStats, JobStoreError, RecordFilter};
pub use types::{
    BackoffStrategy, InvalidItem, JobConfiguration, JobExecutionRecord, JobInput, LogLevel,
    ProgressLogEntry, ResourceMetrics, RetryPolicy,
};
pub use validation::{
    ConfigSchema, FileGate, ImportPolicy, PreflightStage, SecurityViolation, ValidationError,
};
