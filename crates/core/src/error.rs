//! Errors raised while building domain values from untrusted text.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A job, actor or session identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown job status `{0}`")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
