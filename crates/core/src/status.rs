//! Job execution state machine.
//!
//! ```text
//! pending ──► running ──► completed ──► rolled_back
//!    │          │  ▲          │
//!    │          ▼  │          └──► partially_rolled_back ──► rolled_back
//!    │        paused
//!    │          │
//!    └──────────┴──► cancelled        running/pending ──► failed
//! ```
//!
//! The table in [`JobStatus::can_transition_to`] is the single source of truth;
//! the record layer only ever moves status through [`JobStatus::transition`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DomainError;

/// Lifecycle status of a job execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created at submission, not yet started.
    Pending,
    /// A runner is applying chunks.
    Running,
    /// Parked at a chunk boundary; resumable.
    Paused,
    /// All chunks applied.
    Completed,
    /// Stopped by a fatal or exhausted-retry failure.
    Failed,
    /// Stopped by an operator at a chunk boundary.
    Cancelled,
    /// Every compensating action was replayed.
    RolledBack,
    /// A compensating action failed; some descriptors remain unapplied.
    PartiallyRolledBack,
}

/// Transition guard violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job is in terminal status {from}; only rollback of a completed job is allowed (attempted {to})")]
    Terminal { from: JobStatus, to: JobStatus },
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::RolledBack,
        JobStatus::PartiallyRolledBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::RolledBack => "rolled_back",
            JobStatus::PartiallyRolledBack => "partially_rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal statuses are reached at most once per record lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::RolledBack
                | JobStatus::PartiallyRolledBack
        )
    }

    /// Pending, running or paused: a job id in one of these states is "in flight".
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused
        )
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Completed, RolledBack)
                | (Completed, PartiallyRolledBack)
                | (PartiallyRolledBack, RolledBack)
                | (PartiallyRolledBack, PartiallyRolledBack)
        )
    }

    /// Validate and return the target status.
    pub fn transition(self, to: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.can_transition_to(to) {
            return Ok(to);
        }
        if self.is_terminal() {
            Err(TransitionError::Terminal { from: self, to })
        } else {
            Err(TransitionError::InvalidTransition { from: self, to })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_transitions() {
        let s = JobStatus::Pending;
        let s = s.transition(JobStatus::Running).unwrap();
        let s = s.transition(JobStatus::Paused).unwrap();
        let s = s.transition(JobStatus::Running).unwrap();
        let s = s.transition(JobStatus::Completed).unwrap();
        let s = s.transition(JobStatus::RolledBack).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn resume_only_from_paused() {
        assert!(JobStatus::Pending.transition(JobStatus::Paused).is_err());
        assert!(JobStatus::Paused.transition(JobStatus::Paused).is_err());
        assert!(JobStatus::Paused.transition(JobStatus::Running).is_ok());
    }

    #[test]
    fn terminal_statuses_reject_everything_but_rollback() {
        for from in [JobStatus::Failed, JobStatus::Cancelled, JobStatus::RolledBack] {
            for to in JobStatus::ALL {
                assert!(
                    matches!(from.transition(to), Err(TransitionError::Terminal { .. })),
                    "{from} -> {to} should be rejected"
                );
            }
        }
        assert!(JobStatus::Completed.transition(JobStatus::Running).is_err());
        assert!(JobStatus::Completed.transition(JobStatus::RolledBack).is_ok());
    }

    #[test]
    fn status_names_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
        assert_eq!(
            "bogus".parse::<JobStatus>(),
            Err(DomainError::UnknownStatus("bogus".to_string()))
        );
    }

    proptest! {
        #[test]
        fn no_transition_leaves_a_terminal_status_except_rollback(
            from in prop::sample::select(JobStatus::ALL.to_vec()),
            to in prop::sample::select(JobStatus::ALL.to_vec()),
        ) {
            if from.is_terminal() && from.transition(to).is_ok() {
                prop_assert!(matches!(to, JobStatus::RolledBack | JobStatus::PartiallyRolledBack));
            }
        }
    }
}
