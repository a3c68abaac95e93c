//! Failure classification for chunk application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error raised while reading or applying a chunk.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    /// Downstream could not be reached (connection refused/reset, DNS, ...).
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The chunk did not finish within its time budget.
    #[error("chunk timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure the job kind knows to be temporary (deadlock, lock wait, 503).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Input cannot be processed at all (unparseable file, wrong encoding).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// One item in the chunk failed validation; nothing from the chunk was applied.
    #[error("item {index} in chunk is invalid: {reason}")]
    ItemInvalid { index: usize, reason: String },

    /// Anything else; never retried.
    #[error("{0}")]
    Fatal(String),
}

impl ChunkError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn item_invalid(index: usize, reason: impl Into<String>) -> Self {
        Self::ItemInvalid {
            index,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ChunkError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut => ChunkError::Transient(format!("io timeout: {err}")),
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | BrokenPipe | AddrNotAvailable => ChunkError::Connectivity(err.to_string()),
            Interrupted | WouldBlock => ChunkError::Transient(err.to_string()),
            InvalidData | UnexpectedEof => ChunkError::MalformedInput(err.to_string()),
            _ => ChunkError::Fatal(err.to_string()),
        }
    }
}

/// What the runner should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry the same chunk after backoff, up to the retry bound.
    Retryable,
    /// Fail the job immediately; never retry.
    FatalDiscard,
    /// Record the offending item and continue with the rest.
    PartialContinue,
}

/// Decides how a chunk failure is handled.
pub trait RetryClassifier: Send + Sync {
    fn classify(&self, error: &ChunkError) -> FailureClass;
}

/// Classification by error variant.
///
/// | Variant | Class |
/// |---------|-------|
/// | `Connectivity`, `Timeout`, `Transient` | retryable |
/// | `ItemInvalid` | partial-continue |
/// | `MalformedInput`, `Fatal` | fatal-discard |
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryClassifier;

impl RetryClassifier for DefaultRetryClassifier {
    fn classify(&self, error: &ChunkError) -> FailureClass {
        match error {
            ChunkError::Connectivity(_) | ChunkError::Timeout(_) | ChunkError::Transient(_) => {
                FailureClass::Retryable
            }
            ChunkError::ItemInvalid { .. } => FailureClass::PartialContinue,
            ChunkError::MalformedInput(_) | ChunkError::Fatal(_) => FailureClass::FatalDiscard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn variants_map_to_classes() {
        let c = DefaultRetryClassifier;
        assert_eq!(c.classify(&ChunkError::Connectivity("db down".into())), FailureClass::Retryable);
        assert_eq!(c.classify(&ChunkError::Timeout(Duration::from_secs(1))), FailureClass::Retryable);
        assert_eq!(c.classify(&ChunkError::transient("deadlock")), FailureClass::Retryable);
        assert_eq!(c.classify(&ChunkError::malformed("bad utf-8")), FailureClass::FatalDiscard);
        assert_eq!(c.classify(&ChunkError::fatal("boom")), FailureClass::FatalDiscard);
        assert_eq!(c.classify(&ChunkError::item_invalid(3, "sku missing")), FailureClass::PartialContinue);
    }

    #[test]
    fn io_errors_are_mapped_by_kind() {
        let c = DefaultRetryClassifier;
        let refused: ChunkError = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert_eq!(c.classify(&refused), FailureClass::Retryable);

        let garbage: ChunkError = io::Error::new(io::ErrorKind::InvalidData, "not utf-8").into();
        assert_eq!(c.classify(&garbage), FailureClass::FatalDiscard);

        let denied: ChunkError = io::Error::new(io::ErrorKind::PermissionDenied, "ro").into();
        assert_eq!(c.classify(&denied), FailureClass::FatalDiscard);
    }
}
