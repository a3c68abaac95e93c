//! `bulkops-core`: domain foundation for the bulk-operation framework.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the job status state machine.

pub mod error;
pub mod id;
pub mod status;

pub use error::DomainError;
pub use id::{ActorId, JobId, SessionId};
pub use status::{JobStatus, TransitionError};
