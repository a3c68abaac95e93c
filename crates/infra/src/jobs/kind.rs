//! Job kinds and the capabilities they declare.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::batch::{Chunk, DataSource};
use super::retry::ChunkError;
use super::rollback::{Compensation, Rollbackable};
use super::types::{InvalidItem, JobConfiguration, JobInput};
use super::validation::{ConfigSchema, PreflightStage};

/// What a job kind supports beyond running forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub rollbackable: bool,
    pub resumable: bool,
}

/// Result of applying one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    /// Inverse operations for every mutation the chunk made, in application order.
    pub compensations: Vec<Compensation>,
    /// Items the kind skipped on its own after validating them.
    pub invalid_items: Vec<InvalidItem>,
}

impl ChunkOutcome {
    pub fn applied() -> Self {
        Self::default()
    }

    pub fn with_compensations(compensations: Vec<Compensation>) -> Self {
        Self {
            compensations,
            invalid_items: Vec::new(),
        }
    }
}

/// Capability of kinds that can reopen their source at a checkpoint.
#[async_trait]
pub trait Resumable: Send + Sync {
    async fn reopen(
        &self,
        input: &JobInput,
        config: &JobConfiguration,
        offset: u64,
    ) -> Result<Box<dyn DataSource>, ChunkError>;
}

/// A kind of bulk operation (file import, data migration, ...).
///
/// The runner owns sequencing, retries, progress and state; the kind only
/// opens its source and applies chunks. Chunks may be applied more than once
/// after a retry, so `apply_chunk` should tolerate re-application.
///
/// When an item fails validation, `apply_chunk` either reports it in
/// [`ChunkOutcome::invalid_items`] after applying the rest, or returns
/// [`ChunkError::ItemInvalid`] having applied nothing, in which case the runner
/// drops that item and applies the chunk again.
#[async_trait]
pub trait BulkJob: Send + Sync {
    fn kind(&self) -> &str;

    /// Required configuration keys. Defaults to the framework keys.
    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::framework()
    }

    /// Values used for keys the submitter leaves out.
    fn default_configuration(&self) -> JobConfiguration {
        JobConfiguration::defaults()
    }

    /// Kind-specific pre-flight stages, run after the configuration check.
    fn preflight(&self) -> Vec<Arc<dyn PreflightStage>> {
        Vec::new()
    }

    async fn open(
        &self,
        input: &JobInput,
        config: &JobConfiguration,
    ) -> Result<Box<dyn DataSource>, ChunkError>;

    async fn apply_chunk(
        &self,
        chunk: &Chunk,
        config: &JobConfiguration,
    ) -> Result<ChunkOutcome, ChunkError>;

    fn as_rollbackable(&self) -> Option<&dyn Rollbackable> {
        None
    }

    fn as_resumable(&self) -> Option<&dyn Resumable> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            rollbackable: self.as_rollbackable().is_some(),
            resumable: self.as_resumable().is_some(),
        }
    }
}
