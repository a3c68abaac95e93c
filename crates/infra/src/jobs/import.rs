//! Built-in delimited-file import kind.
//!
//! Rows are read as JSON objects keyed by header. What a row *means* is left
//! to an [`ImportSink`]; this module only handles reading, gating and
//! capability plumbing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, info};

use super::batch::{Chunk, DataSource, SourceBatch, SourceItem};
use super::kind::{BulkJob, ChunkOutcome, Resumable};
use super::retry::ChunkError;
use super::rollback::{CompensatingAction, Compensation, CompensationError, Rollbackable};
use super::types::{InvalidItem, JobConfiguration, JobInput};
use super::validation::{FileGate, ImportPolicy, PreflightStage};

pub const CSV_IMPORT_KIND: &str = "csv_import";

/// Split one delimited line, honouring double-quoted fields and `""` escapes.
pub fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                fields.push(field.trim().to_string());
                field.clear();
            }
            c => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

/// Header fields of a delimited stream: the first non-blank line, with any
/// UTF-8 byte-order mark removed. `None` when the stream has no such line.
pub async fn read_header<R>(lines: &mut Lines<R>, delimiter: char) -> std::io::Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_start_matches('\u{feff}');
        if line.trim().is_empty() {
            continue;
        }
        return Ok(Some(split_record(line, delimiter)));
    }
    Ok(None)
}

type LineReader = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Reads a delimited file with a header row.
///
/// Blank lines are ignored. Lines whose field count does not match the header
/// are handed back as rejected positions instead of items.
pub struct CsvFileSource {
    lines: LineReader,
    headers: Vec<String>,
    delimiter: char,
    position: u64,
    total: Option<u64>,
    /// Rows read before a failed line read; the retried read continues from them.
    partial: SourceBatch,
}

impl CsvFileSource {
    /// Open `path` and skip the first `offset` data rows.
    pub async fn open(path: &Path, delimiter: char, offset: u64) -> Result<Self, ChunkError> {
        let total = count_data_lines(path, delimiter).await?;
        let mut source = Self::from_reader(File::open(path).await?, delimiter).await?;
        source.total = Some(total);
        while source.position < offset {
            match source.next_line().await? {
                Some(_) => source.position += 1,
                None => break,
            }
        }
        debug!(path = %path.display(), offset, total, "opened delimited source");
        Ok(source)
    }

    /// Read the header from `reader`; the total is unknown.
    pub async fn from_reader<R>(reader: R, delimiter: char) -> Result<Self, ChunkError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(BufReader::new(reader));
        let mut lines = reader.lines();
        let headers = read_header(&mut lines, delimiter)
            .await?
            .ok_or_else(|| ChunkError::malformed("file has no header row"))?;
        Ok(Self {
            lines,
            headers,
            delimiter,
            position: 0,
            total: None,
            partial: SourceBatch::default(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    async fn next_line(&mut self) -> Result<Option<String>, ChunkError> {
        loop {
            match self.lines.next_line().await? {
                Some(l) if l.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    fn parse(&self, line: &str) -> Result<JsonValue, String> {
        let fields = split_record(line, self.delimiter);
        if fields.len() != self.headers.len() {
            return Err(format!(
                "expected {} fields, found {}",
                self.headers.len(),
                fields.len()
            ));
        }
        let row: Map<String, JsonValue> = self
            .headers
            .iter()
            .cloned()
            .zip(fields.into_iter().map(JsonValue::String))
            .collect();
        Ok(JsonValue::Object(row))
    }
}

async fn count_data_lines(path: &Path, delimiter: char) -> Result<u64, ChunkError> {
    let mut lines = BufReader::new(File::open(path).await?).lines();
    if read_header(&mut lines, delimiter).await?.is_none() {
        return Ok(0);
    }
    let mut count = 0u64;
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[async_trait]
impl DataSource for CsvFileSource {
    fn total_hint(&self) -> Option<u64> {
        self.total
    }

    async fn next_batch(&mut self, max: usize) -> Result<Option<SourceBatch>, ChunkError> {
        let mut batch = std::mem::take(&mut self.partial);
        while batch.len() < max.max(1) {
            let line = match self.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    self.partial = batch;
                    return Err(e);
                }
            };
            let position = self.position;
            self.position += 1;
            match self.parse(&line) {
                Ok(value) => batch.items.push(SourceItem { position, value }),
                Err(reason) => batch
                    .rejected
                    .push(InvalidItem::new(position, reason).with_item(JsonValue::String(line))),
            }
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

/// Destination of imported rows; holds the domain logic.
#[async_trait]
pub trait ImportSink: Send + Sync {
    /// Apply `rows` and return compensations for every mutation made.
    ///
    /// Return [`ChunkError::ItemInvalid`] (with the row's index in `rows`)
    /// without applying anything when a row fails validation.
    async fn apply(&self, rows: &[JsonValue]) -> Result<Vec<Compensation>, ChunkError>;

    /// Undo one recorded mutation.
    async fn compensate(&self, action: &CompensatingAction) -> Result<(), CompensationError>;

    fn supports_rollback(&self) -> bool {
        true
    }
}

/// Delimited-file import through an [`ImportSink`].
pub struct CsvImportJob {
    gate: FileGate,
    sink: Arc<dyn ImportSink>,
}

impl CsvImportJob {
    pub fn new(policy: ImportPolicy, sink: Arc<dyn ImportSink>) -> Self {
        Self {
            gate: FileGate::new(policy),
            sink,
        }
    }

    pub fn with_required_headers(mut self, headers: &[&str]) -> Self {
        self.gate = self.gate.with_required_headers(headers);
        self
    }

    async fn source_at(&self, input: &JobInput, offset: u64) -> Result<Box<dyn DataSource>, ChunkError> {
        let path = self.path_of(input)?;
        let resolved = self
            .gate
            .resolve(&path)
            .await
            .map_err(|e| ChunkError::fatal(e.to_string()))?;
        let source = CsvFileSource::open(&resolved, self.gate.policy().delimiter, offset).await?;
        Ok(Box::new(source))
    }

    fn path_of(&self, input: &JobInput) -> Result<PathBuf, ChunkError> {
        match input {
            JobInput::File { path } => Ok(path.clone()),
            other => Err(ChunkError::fatal(format!(
                "{CSV_IMPORT_KIND} cannot read {}",
                other.describe()
            ))),
        }
    }
}

#[async_trait]
impl BulkJob for CsvImportJob {
    fn kind(&self) -> &str {
        CSV_IMPORT_KIND
    }

    fn preflight(&self) -> Vec<Arc<dyn PreflightStage>> {
        vec![Arc::new(self.gate.clone())]
    }

    async fn open(
        &self,
        input: &JobInput,
        _config: &JobConfiguration,
    ) -> Result<Box<dyn DataSource>, ChunkError> {
        info!(input = %input.describe(), "opening import");
        self.source_at(input, 0).await
    }

    async fn apply_chunk(
        &self,
        chunk: &Chunk,
        _config: &JobConfiguration,
    ) -> Result<ChunkOutcome, ChunkError> {
        let rows: Vec<JsonValue> = chunk.values().cloned().collect();
        let compensations = self.sink.apply(&rows).await?;
        Ok(ChunkOutcome::with_compensations(compensations))
    }

    fn as_rollbackable(&self) -> Option<&dyn Rollbackable> {
        self.sink.supports_rollback().then_some(self as &dyn Rollbackable)
    }

    fn as_resumable(&self) -> Option<&dyn Resumable> {
        Some(self)
    }
}

#[async_trait]
impl Rollbackable for CsvImportJob {
    async fn compensate(&self, action: &CompensatingAction) -> Result<(), CompensationError> {
        self.sink.compensate(action).await
    }
}

#[async_trait]
impl Resumable for CsvImportJob {
    async fn reopen(
        &self,
        input: &JobInput,
        _config: &JobConfiguration,
        offset: u64,
    ) -> Result<Box<dyn DataSource>, ChunkError> {
        info!(input = %input.describe(), offset, "reopening import at checkpoint");
        self.source_at(input, offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    /// Hands out one scripted read result per `poll_read`.
    struct Scripted(VecDeque<std::io::Result<Vec<u8>>>);

    impl AsyncRead for Scripted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    buf.put_slice(&bytes);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    fn csv(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn splits_quoted_fields() {
        assert_eq!(split_record("a, b ,c", ','), vec!["a", "b", "c"]);
        assert_eq!(
            split_record(r#""x,y","say ""hi""",z"#, ','),
            vec!["x,y", r#"say "hi""#, "z"]
        );
        assert_eq!(split_record("a\tb", '\t'), vec!["a", "b"]);
        assert_eq!(split_record("", ','), vec![""]);
    }

    #[tokio::test]
    async fn reads_rows_as_objects_and_rejects_bad_lines() {
        let f = csv("sku,qty\nA,1\n\nB,2,extra\nC,3\n");
        let mut source = CsvFileSource::open(f.path(), ',', 0).await.unwrap();
        assert_eq!(source.total_hint(), Some(3));
        assert_eq!(source.headers(), ["sku", "qty"]);

        let batch = source.next_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.items[0].value["sku"], "A");
        assert_eq!(batch.items[1].position, 2);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].position, 1);

        assert!(source.next_batch(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opens_at_offset() {
        let f = csv("sku,qty\nA,1\nB,2\nC,3\n");
        let mut source = CsvFileSource::open(f.path(), ',', 2).await.unwrap();
        let batch = source.next_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].position, 2);
        assert_eq!(batch.items[0].value["sku"], "C");
    }

    #[tokio::test]
    async fn empty_file_is_malformed() {
        let f = csv("");
        let err = CsvFileSource::open(f.path(), ',', 0).await.err().unwrap();
        assert!(matches!(err, ChunkError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn invalid_utf8_is_malformed() {
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        f.write_all(b"sku,qty\n\xff\xfe,1\n").unwrap();
        let mut source = CsvFileSource::open(f.path(), ',', 0).await;
        let err = match source.as_mut() {
            Ok(s) => s.next_batch(10).await.unwrap_err(),
            Err(e) => e.clone(),
        };
        assert!(matches!(err, ChunkError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn header_skips_blank_lines_and_byte_order_mark() {
        let f = csv("\n\u{feff}sku,qty\nA,1\n");
        let mut source = CsvFileSource::open(f.path(), ',', 0).await.unwrap();
        assert_eq!(source.headers(), ["sku", "qty"]);
        assert_eq!(source.total_hint(), Some(1));
        let batch = source.next_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.items[0].value["sku"], "A");
    }

    #[tokio::test]
    async fn failed_read_keeps_rows_already_read_in_the_batch() {
        let reader = Scripted(VecDeque::from([
            Ok(b"sku,qty\nA,1\nB,2\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk")),
            Ok(b"C,3\nD,4\n".to_vec()),
        ]));
        let mut source = CsvFileSource::from_reader(reader, ',').await.unwrap();

        let err = source.next_batch(3).await.unwrap_err();
        assert!(matches!(err, ChunkError::Transient(_)));

        let batch = source.next_batch(3).await.unwrap().unwrap();
        let skus: Vec<_> = batch.items.iter().map(|i| i.value["sku"].clone()).collect();
        assert_eq!(skus, ["A", "B", "C"]);
        assert_eq!(
            batch.items.iter().map(|i| i.position).collect::<Vec<_>>(),
            [0, 1, 2]
        );

        let rest = source.next_batch(3).await.unwrap().unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].value["sku"], "D");
        assert!(source.next_batch(3).await.unwrap().is_none());
    }
}
