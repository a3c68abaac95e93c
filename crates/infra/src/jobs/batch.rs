//! Chunking of bounded or streamed sources with monotonic batch-size shrink.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use super::retry::ChunkError;
use super::types::{InvalidItem, JobConfiguration};

/// One item read from a source, tagged with its zero-based source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub position: u64,
    pub value: JsonValue,
}

/// What a source hands back for one read.
///
/// `rejected` holds positions the source could not even turn into items
/// (e.g. a CSV line with the wrong column count); they still count as consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub items: Vec<SourceItem>,
    pub rejected: Vec<InvalidItem>,
}

impl SourceBatch {
    pub fn len(&self) -> usize {
        self.items.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded collection or cursor that yields items in a stable order.
#[async_trait]
pub trait DataSource: Send {
    /// Number of items the source expects to yield, if known.
    fn total_hint(&self) -> Option<u64>;

    /// Read up to `max` positions. `Ok(None)` means the source is exhausted.
    async fn next_batch(&mut self, max: usize) -> Result<Option<SourceBatch>, ChunkError>;
}

/// In-memory source over a vector of values.
#[derive(Debug, Clone)]
pub struct VecSource {
    items: Vec<JsonValue>,
    cursor: usize,
}

impl VecSource {
    pub fn new(items: Vec<JsonValue>) -> Self {
        Self { items, cursor: 0 }
    }

    /// Skip the first `offset` items (resume from a checkpoint).
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.cursor = (offset as usize).min(self.items.len());
        self
    }
}

#[async_trait]
impl DataSource for VecSource {
    fn total_hint(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }

    async fn next_batch(&mut self, max: usize) -> Result<Option<SourceBatch>, ChunkError> {
        if self.cursor >= self.items.len() {
            return Ok(None);
        }
        let end = (self.cursor + max.max(1)).min(self.items.len());
        let items = self.items[self.cursor..end]
            .iter()
            .enumerate()
            .map(|(i, value)| SourceItem {
                position: (self.cursor + i) as u64,
                value: value.clone(),
            })
            .collect();
        self.cursor = end;
        Ok(Some(SourceBatch {
            items,
            rejected: Vec::new(),
        }))
    }
}

/// A unit of work handed to the job kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 1-based, strictly increasing within a job.
    pub number: u64,
    /// Source offset of the first position in this chunk.
    pub offset: u64,
    pub items: Vec<SourceItem>,
    pub rejected: Vec<InvalidItem>,
}

impl Chunk {
    /// Positions consumed from the source (valid items plus source-level rejects).
    pub fn len(&self) -> usize {
        self.items.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> impl Iterator<Item = &JsonValue> {
        self.items.iter().map(|i| &i.value)
    }
}

/// Splits a source into chunks.
///
/// The batch size starts at the configured value and only ever shrinks, by
/// `shrink_factor`, never below `min_batch_size`.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    batch_size: usize,
    min_batch_size: usize,
    shrink_factor: f64,
    next_number: u64,
    offset: u64,
}

impl BatchProcessor {
    pub fn new(batch_size: usize, min_batch_size: usize, shrink_factor: f64) -> Self {
        let batch_size = batch_size.max(1);
        let shrink_factor = if shrink_factor > 0.0 && shrink_factor < 1.0 {
            shrink_factor
        } else {
            0.5
        };
        Self {
            batch_size,
            min_batch_size: min_batch_size.clamp(1, batch_size),
            shrink_factor,
            next_number: 1,
            offset: 0,
        }
    }

    pub fn from_configuration(config: &JobConfiguration) -> Self {
        Self::new(
            config.batch_size(),
            config.min_batch_size(),
            config.shrink_factor(),
        )
    }

    /// Continue numbering after a checkpoint.
    pub fn resume_at(mut self, last_batch_number: u64, offset: u64) -> Self {
        self.next_number = last_batch_number + 1;
        self.offset = offset;
        self
    }

    /// Continue from a previously shrunk size; never grows past the current one.
    pub fn with_current_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.batch_size = size.clamp(self.min_batch_size, self.batch_size);
        }
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn at_minimum(&self) -> bool {
        self.batch_size <= self.min_batch_size
    }

    /// Shrink after a throttle signal. Returns `false` when already at the floor.
    pub fn shrink(&mut self) -> bool {
        if self.at_minimum() {
            return false;
        }
        let next = ((self.batch_size as f64) * self.shrink_factor).floor() as usize;
        let next = next.max(self.min_batch_size);
        info!(from = self.batch_size, to = next, "shrinking batch size");
        self.batch_size = next;
        true
    }

    /// Read the next chunk. The final chunk may be smaller than the batch size.
    pub async fn next_chunk(
        &mut self,
        source: &mut dyn DataSource,
    ) -> Result<Option<Chunk>, ChunkError> {
        let Some(batch) = source.next_batch(self.batch_size).await? else {
            return Ok(None);
        };
        if batch.is_empty() {
            return Ok(None);
        }
        let chunk = Chunk {
            number: self.next_number,
            offset: self.offset,
            items: batch.items,
            rejected: batch.rejected,
        };
        debug!(chunk = chunk.number, size = chunk.len(), "read chunk");
        self.next_number += 1;
        self.offset += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Apply `op` to every chunk in order, yielding the running processed count
    /// with each chunk's result. Stops at the first error.
    pub async fn for_each_chunk<F, Fut, T>(
        &mut self,
        source: &mut dyn DataSource,
        mut op: F,
    ) -> Result<Vec<(u64, T)>, ChunkError>
    where
        F: FnMut(Chunk) -> Fut,
        Fut: Future<Output = Result<T, ChunkError>>,
    {
        let mut processed = 0u64;
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk(source).await? {
            let size = chunk.len() as u64;
            let result = op(chunk).await?;
            processed += size;
            out.push((processed, result));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn items(n: usize) -> Vec<JsonValue> {
        (0..n).map(|i| json!(i)).collect()
    }

    fn sizes(batch: usize, n: usize) -> Vec<usize> {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut source = VecSource::new(items(n));
            let mut bp = BatchProcessor::new(batch, 1, 0.5);
            bp.for_each_chunk(&mut source, |c| async move { Ok(c.len()) })
                .await
                .unwrap()
                .into_iter()
                .map(|(_, size)| size)
                .collect()
        })
    }

    #[tokio::test]
    async fn splits_2500_into_1000_1000_500() {
        let mut source = VecSource::new(items(2500));
        let mut bp = BatchProcessor::new(1000, 50, 0.5);
        let out = bp
            .for_each_chunk(&mut source, |c| async move { Ok((c.number, c.offset, c.len())) })
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![
                (1000, (1, 0, 1000)),
                (2000, (2, 1000, 1000)),
                (2500, (3, 2000, 500)),
            ]
        );
    }

    #[tokio::test]
    async fn empty_source_yields_no_chunks() {
        let mut source = VecSource::new(vec![]);
        let mut bp = BatchProcessor::new(1000, 50, 0.5);
        assert!(bp.next_chunk(&mut source).await.unwrap().is_none());
    }

    #[test]
    fn shrink_is_monotonic_and_floored() {
        let mut bp = BatchProcessor::new(1000, 100, 0.5);
        assert!(bp.shrink());
        assert_eq!(bp.batch_size(), 500);
        assert!(bp.shrink());
        assert!(bp.shrink());
        assert_eq!(bp.batch_size(), 125);
        assert!(bp.shrink());
        assert_eq!(bp.batch_size(), 100);
        assert!(bp.at_minimum());
        assert!(!bp.shrink());
        assert_eq!(bp.batch_size(), 100);
    }

    #[test]
    fn current_size_never_grows() {
        let bp = BatchProcessor::new(100, 10, 0.5).with_current_size(5000);
        assert_eq!(bp.batch_size(), 100);
        let bp = BatchProcessor::new(100, 10, 0.5).with_current_size(25);
        assert_eq!(bp.batch_size(), 25);
    }

    #[tokio::test]
    async fn resumes_numbering_from_checkpoint() {
        let mut source = VecSource::new(items(30)).starting_at(20);
        let mut bp = BatchProcessor::new(10, 1, 0.5).resume_at(2, 20);
        let chunk = bp.next_chunk(&mut source).await.unwrap().unwrap();
        assert_eq!(chunk.number, 3);
        assert_eq!(chunk.offset, 20);
        assert_eq!(chunk.items[0].position, 20);
        assert!(bp.next_chunk(&mut source).await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn chunks_partition_the_source(n in 0usize..3000, batch in 1usize..700) {
            let sizes = sizes(batch, n);
            prop_assert_eq!(sizes.iter().sum::<usize>(), n);
            if let Some((last, full)) = sizes.split_last() {
                prop_assert!(full.iter().all(|s| *s == batch));
                prop_assert!(*last > 0 && *last <= batch);
            }
        }
    }
}
