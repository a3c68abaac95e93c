//! Compensating-action capture and best-effort rollback.
//!
//! Every chunk that mutates durable state hands back compensating actions
//! (target identity + pre-mutation values or an inverse operation). They are
//! appended to the record in application order and replayed in reverse.
//! Rollback is not a transactional undo: the first failing compensation halts
//! the replay and leaves the record `partially_rolled_back` with a report of
//! what was and was not applied.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use bulkops_core::{JobStatus, TransitionError};

use super::types::JobExecutionRecord;

/// A recorded inverse operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatingAction {
    /// Position in the job's rollback log (0-based, application order).
    pub sequence: u64,
    /// Chunk that produced the mutation.
    pub chunk_number: u64,
    /// Identity of the mutated target (table/key, file, ...).
    pub target: String,
    /// Pre-mutation values or inverse operation, interpreted by the job kind.
    pub action: JsonValue,
    pub captured_at: DateTime<Utc>,
}

/// Compensation returned by a chunk before it is sequenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub target: String,
    pub action: JsonValue,
}

impl Compensation {
    pub fn new(target: impl Into<String>, action: JsonValue) -> Self {
        Self {
            target: target.into(),
            action,
        }
    }
}

/// Outcome of a rollback attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Sequences applied so far, in the order they were applied.
    pub applied: Vec<u64>,
    /// Sequences still to apply, in the order they would be applied.
    pub remaining: Vec<u64>,
    pub failed_at: Option<u64>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty() && self.failed_at.is_none()
    }
}

/// Failure of a single compensating step.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("compensation failed: {0}")]
pub struct CompensationError(pub String);

impl CompensationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RollbackError {
    /// Rollback requested but nothing was captured; no state was touched.
    #[error("job has no captured compensating data; refusing to roll back")]
    NothingToRollback,

    #[error("rollback requires a completed job, found {0}")]
    InvalidStatus(JobStatus),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Replay stopped; the record is now `partially_rolled_back`.
    #[error("rollback halted at descriptor {sequence}: {message}")]
    Halted {
        sequence: u64,
        message: String,
        report: RollbackReport,
    },
}

/// Capability of job kinds whose mutations can be reversed.
#[async_trait::async_trait]
pub trait Rollbackable: Send + Sync {
    async fn compensate(&self, action: &CompensatingAction) -> Result<(), CompensationError>;
}

/// Appends and replays compensating actions on a job record.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollbackManager;

impl RollbackManager {
    pub fn new() -> Self {
        Self
    }

    /// Sequence and append a chunk's compensations. Existing entries are never edited.
    pub fn capture(
        &self,
        record: &mut JobExecutionRecord,
        chunk_number: u64,
        compensations: Vec<Compensation>,
    ) {
        let now = Utc::now();
        let mut next = record.rollback_data.len() as u64;
        for c in compensations {
            record.rollback_data.push(CompensatingAction {
                sequence: next,
                chunk_number,
                target: c.target,
                action: c.action,
                captured_at: now,
            });
            next += 1;
        }
    }

    /// Replay the record's compensations in reverse application order.
    ///
    /// On a previously `partially_rolled_back` record, only the descriptors
    /// not yet applied are replayed. Guards run before any compensation, so a
    /// rejected rollback leaves the record untouched.
    pub async fn rollback(
        &self,
        record: &mut JobExecutionRecord,
        compensator: &dyn Rollbackable,
    ) -> Result<RollbackReport, RollbackError> {
        if !matches!(
            record.status,
            JobStatus::Completed | JobStatus::PartiallyRolledBack
        ) {
            return Err(RollbackError::InvalidStatus(record.status));
        }
        if record.rollback_data.is_empty() {
            return Err(RollbackError::NothingToRollback);
        }

        let already: BTreeSet<u64> = record
            .rollback_report
            .as_ref()
            .map(|r| r.applied.iter().copied().collect())
            .unwrap_or_default();

        let mut report = RollbackReport {
            applied: record
                .rollback_report
                .as_ref()
                .map(|r| r.applied.clone())
                .unwrap_or_default(),
            ..Default::default()
        };

        let pending: Vec<&CompensatingAction> = record
            .rollback_data
            .iter()
            .rev()
            .filter(|a| !already.contains(&a.sequence))
            .collect();

        info!(
            job_id = %record.version,
            pending = pending.len(),
            already_applied = already.len(),
            "replaying compensating actions"
        );

        let mut failure = None;
        for (idx, action) in pending.iter().enumerate() {
            match compensator.compensate(action).await {
                Ok(()) => report.applied.push(action.sequence),
                Err(e) => {
                    error!(
                        job_id = %record.version,
                        sequence = action.sequence,
                        target = %action.target,
                        error = %e,
                        "compensating action failed; halting rollback"
                    );
                    report.failed_at = Some(action.sequence);
                    report.error = Some(e.to_string());
                    report.remaining = pending[idx..].iter().map(|a| a.sequence).collect();
                    failure = Some((action.sequence, e));
                    break;
                }
            }
        }
        report.finished_at = Some(Utc::now());

        match failure {
            None => {
                record.transition(JobStatus::RolledBack)?;
                record.rollback_report = Some(report.clone());
                record.status_message = Some(format!(
                    "rolled back {} compensating actions",
                    report.applied.len()
                ));
                Ok(report)
            }
            Some((sequence, e)) => {
                record.transition(JobStatus::PartiallyRolledBack)?;
                record.record_error(&e);
                record.rollback_report = Some(report.clone());
                warn!(
                    job_id = %record.version,
                    applied = report.applied.len(),
                    remaining = report.remaining.len(),
                    "job left partially rolled back"
                );
                Err(RollbackError::Halted {
                    sequence,
                    message: e.0,
                    report,
                })
            }
        }
    }
}
