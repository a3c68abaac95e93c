//! Pre-flight checks run before a job record may leave `pending`.
//!
//! Stages run in order and the first failure wins. Any failure here is fatal:
//! the job never reaches `running`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, warn};

use super::import::read_header;
use super::types::{JobConfiguration, JobInput, config_keys};

/// Input was rejected before the job started.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required configuration key `{0}`")]
    MissingKey(String),

    #[error("configuration key `{key}` must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("configuration key `{key}` = {value} violates {constraint}")]
    OutOfRange {
        key: String,
        value: f64,
        constraint: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),

    #[error("input unavailable: {0}")]
    Unavailable(String),

    #[error("input is missing required headers: {}", .0.join(", "))]
    MissingHeaders(Vec<String>),

    #[error("unsupported input for this job kind: {0}")]
    UnsupportedInput(String),

    #[error(transparent)]
    Security(#[from] SecurityViolation),
}

impl ValidationError {
    pub fn is_security(&self) -> bool {
        matches!(self, ValidationError::Security(_))
    }
}

/// Rejected input that looks like misuse rather than a mistake.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SecurityViolation {
    #[error("path resolves outside the allowed root: {0}")]
    OutsideRoot(PathBuf),

    #[error("file type `{0}` is not allowed")]
    ForbiddenExtension(String),

    #[error("file is {size} bytes; limit is {max}")]
    TooLarge { size: u64, max: u64 },
}

/// Expected JSON type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Integer,
    Number,
    String,
    Boolean,
}

impl KeyKind {
    fn describe(&self) -> &'static str {
        match self {
            KeyKind::Integer => "a non-negative integer",
            KeyKind::Number => "a number",
            KeyKind::String => "a string",
            KeyKind::Boolean => "a boolean",
        }
    }

    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            KeyKind::Integer => value.as_u64().is_some(),
            KeyKind::Number => value.as_f64().is_some(),
            KeyKind::String => value.is_string(),
            KeyKind::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Inclusive(f64),
    Exclusive(f64),
}

/// One required key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRule {
    pub key: String,
    pub kind: KeyKind,
    pub min: Option<Bound>,
    pub max: Option<Bound>,
}

impl KeyRule {
    fn check(&self, value: &JsonValue) -> Result<(), ValidationError> {
        if !self.kind.accepts(value) {
            return Err(ValidationError::WrongType {
                key: self.key.clone(),
                expected: self.kind.describe(),
            });
        }
        let Some(v) = value.as_f64() else {
            return Ok(());
        };
        let out_of_range = |constraint: String| ValidationError::OutOfRange {
            key: self.key.clone(),
            value: v,
            constraint,
        };
        match self.min {
            Some(Bound::Inclusive(min)) if v < min => return Err(out_of_range(format!(">= {min}"))),
            Some(Bound::Exclusive(min)) if v <= min => return Err(out_of_range(format!("> {min}"))),
            _ => {}
        }
        match self.max {
            Some(Bound::Inclusive(max)) if v > max => Err(out_of_range(format!("<= {max}"))),
            Some(Bound::Exclusive(max)) if v >= max => Err(out_of_range(format!("< {max}"))),
            _ => Ok(()),
        }
    }
}

/// Required-key schema for a job configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSchema {
    rules: Vec<KeyRule>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys every job needs for batching and resource monitoring.
    pub fn framework() -> Self {
        Self::new()
            .require(config_keys::BATCH_SIZE, KeyKind::Integer, Some(Bound::Inclusive(1.0)), None)
            .require(config_keys::MIN_BATCH_SIZE, KeyKind::Integer, Some(Bound::Inclusive(1.0)), None)
            .require(
                config_keys::SHRINK_FACTOR,
                KeyKind::Number,
                Some(Bound::Exclusive(0.0)),
                Some(Bound::Exclusive(1.0)),
            )
            .require(config_keys::MEMORY_THRESHOLD_MB, KeyKind::Number, Some(Bound::Exclusive(0.0)), None)
            .require(
                config_keys::CPU_THRESHOLD_PERCENT,
                KeyKind::Number,
                Some(Bound::Exclusive(0.0)),
                Some(Bound::Inclusive(100.0)),
            )
    }

    pub fn require(
        mut self,
        key: impl Into<String>,
        kind: KeyKind,
        min: Option<Bound>,
        max: Option<Bound>,
    ) -> Self {
        let key = key.into();
        self.rules.retain(|r| r.key != key);
        self.rules.push(KeyRule { key, kind, min, max });
        self
    }

    /// Add every rule of `other`, replacing rules for the same key.
    pub fn extend(mut self, other: &ConfigSchema) -> Self {
        for rule in &other.rules {
            self = self.require(rule.key.clone(), rule.kind, rule.min, rule.max);
        }
        self
    }

    pub fn rules(&self) -> &[KeyRule] {
        &self.rules
    }

    pub fn validate(&self, config: &JobConfiguration) -> Result<(), ValidationError> {
        for rule in &self.rules {
            let value = config
                .get(&rule.key)
                .ok_or_else(|| ValidationError::MissingKey(rule.key.clone()))?;
            rule.check(value)?;
        }
        if let (Some(min), Some(max)) = (
            config.get_u64(config_keys::MIN_BATCH_SIZE),
            config.get_u64(config_keys::BATCH_SIZE),
        ) {
            if min > max {
                return Err(ValidationError::Inconsistent(format!(
                    "min_batch_size ({min}) exceeds batch_size ({max})"
                )));
            }
        }
        Ok(())
    }
}

/// One pre-flight check.
#[async_trait]
pub trait PreflightStage: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, input: &JobInput, config: &JobConfiguration) -> Result<(), ValidationError>;
}

/// Validates the configuration against a schema.
#[derive(Debug, Clone)]
pub struct ConfigSchemaStage {
    schema: ConfigSchema,
}

impl ConfigSchemaStage {
    pub fn new(schema: ConfigSchema) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl PreflightStage for ConfigSchemaStage {
    fn name(&self) -> &str {
        "configuration"
    }

    async fn check(&self, _input: &JobInput, config: &JobConfiguration) -> Result<(), ValidationError> {
        self.schema.validate(config)
    }
}

/// Run stages in order; the first failure wins.
pub async fn run_preflight(
    stages: &[Arc<dyn PreflightStage>],
    input: &JobInput,
    config: &JobConfiguration,
) -> Result<(), ValidationError> {
    for stage in stages {
        if let Err(e) = stage.check(input, config).await {
            if e.is_security() {
                error!(security = true, stage = stage.name(), input = %input.describe(), error = %e, "pre-flight security violation");
            } else {
                warn!(stage = stage.name(), input = %input.describe(), error = %e, "pre-flight check failed");
            }
            return Err(e);
        }
        debug!(stage = stage.name(), "pre-flight stage passed");
    }
    Ok(())
}

/// Limits on files accepted for import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportPolicy {
    /// Every import must resolve inside this directory.
    pub allowed_root: PathBuf,
    pub max_size_bytes: u64,
    /// Lower-case extensions without the dot.
    pub allowed_extensions: Vec<String>,
    /// Headers every import must carry; job kinds may add more.
    pub required_headers: Vec<String>,
    pub delimiter: char,
}

impl Default for ImportPolicy {
    fn default() -> Self {
        Self {
            allowed_root: PathBuf::from("."),
            max_size_bytes: 100 * 1024 * 1024,
            allowed_extensions: vec!["csv".to_string(), "tsv".to_string(), "txt".to_string()],
            required_headers: Vec::new(),
            delimiter: ',',
        }
    }
}

/// Security and structure gate for file imports.
#[derive(Debug, Clone)]
pub struct FileGate {
    policy: ImportPolicy,
}

impl FileGate {
    pub fn new(policy: ImportPolicy) -> Self {
        Self { policy }
    }

    pub fn with_required_headers(mut self, headers: &[&str]) -> Self {
        for h in headers {
            if !self.policy.required_headers.iter().any(|x| x == h) {
                self.policy.required_headers.push(h.to_string());
            }
        }
        self
    }

    pub fn policy(&self) -> &ImportPolicy {
        &self.policy
    }

    /// Resolve `path` against the allowed root and confirm it stays inside.
    pub async fn resolve(&self, path: &Path) -> Result<PathBuf, ValidationError> {
        let root = tokio::fs::canonicalize(&self.policy.allowed_root)
            .await
            .map_err(|e| ValidationError::Unavailable(format!("import root: {e}")))?;
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|e| ValidationError::Unavailable(format!("{}: {e}", path.display())))?;
        if !resolved.starts_with(&root) {
            return Err(SecurityViolation::OutsideRoot(path.to_path_buf()).into());
        }
        Ok(resolved)
    }

    async fn check_file(&self, path: &Path) -> Result<(), ValidationError> {
        let resolved = self.resolve(path).await?;

        let ext = resolved
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.policy.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
            return Err(SecurityViolation::ForbiddenExtension(ext).into());
        }

        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;
        if !meta.is_file() {
            return Err(ValidationError::Unavailable(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if meta.len() > self.policy.max_size_bytes {
            return Err(SecurityViolation::TooLarge {
                size: meta.len(),
                max: self.policy.max_size_bytes,
            }
            .into());
        }

        if self.policy.required_headers.is_empty() {
            return Ok(());
        }
        let file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;
        let mut lines = BufReader::new(file).lines();
        let present = read_header(&mut lines, self.policy.delimiter)
            .await
            .map_err(|e| ValidationError::Unavailable(format!("cannot read header: {e}")))?
            .unwrap_or_default();
        let missing: Vec<String> = self
            .policy
            .required_headers
            .iter()
            .filter(|h| !present.iter().any(|p| p == *h))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingHeaders(missing))
        }
    }
}

#[async_trait]
impl PreflightStage for FileGate {
    fn name(&self) -> &str {
        "file-gate"
    }

    async fn check(&self, input: &JobInput, _config: &JobConfiguration) -> Result<(), ValidationError> {
        match input {
            JobInput::File { path } => self.check_file(path).await,
            other => Err(ValidationError::UnsupportedInput(other.describe())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gate(root: &Path) -> FileGate {
        FileGate::new(ImportPolicy {
            allowed_root: root.to_path_buf(),
            max_size_bytes: 1024,
            ..Default::default()
        })
        .with_required_headers(&["sku", "qty"])
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn file(path: impl Into<PathBuf>) -> JobInput {
        JobInput::File { path: path.into() }
    }

    #[test]
    fn framework_schema_accepts_defaults() {
        ConfigSchema::framework().validate(&JobConfiguration::defaults()).unwrap();
    }

    #[test]
    fn schema_reports_missing_and_bad_values() {
        let schema = ConfigSchema::framework();
        let cfg = JobConfiguration::defaults();

        let mut missing = JobConfiguration::new();
        for k in cfg.keys().filter(|k| *k != config_keys::SHRINK_FACTOR) {
            missing.set(k, cfg.get(k).unwrap().clone());
        }
        assert_eq!(
            schema.validate(&missing),
            Err(ValidationError::MissingKey("shrink_factor".into()))
        );

        let bad = cfg.clone().with(config_keys::SHRINK_FACTOR, 1.5);
        assert!(matches!(schema.validate(&bad), Err(ValidationError::OutOfRange { .. })));

        let wrong = cfg.clone().with(config_keys::BATCH_SIZE, "lots");
        assert!(matches!(schema.validate(&wrong), Err(ValidationError::WrongType { .. })));

        let inverted = cfg.with(config_keys::MIN_BATCH_SIZE, 5000);
        assert!(matches!(schema.validate(&inverted), Err(ValidationError::Inconsistent(_))));
    }

    #[tokio::test]
    async fn accepts_well_formed_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stock.csv", "sku,qty\nA,1\n");
        let g = gate(dir.path());
        g.check(&file("stock.csv"), &JobConfiguration::defaults())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_traversal_outside_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("imports");
        std::fs::create_dir(&root).unwrap();
        write(outer.path(), "secret.csv", "sku,qty\n");

        let err = gate(&root)
            .check(&file("../secret.csv"), &JobConfiguration::defaults())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Security(SecurityViolation::OutsideRoot(_))));
    }

    #[tokio::test]
    async fn rejects_forbidden_type_and_size() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run.sh", "sku,qty\n");
        write(dir.path(), "big.csv", &format!("sku,qty\n{}", "x".repeat(2048)));
        let g = gate(dir.path());
        let cfg = JobConfiguration::defaults();

        assert!(matches!(
            g.check(&file("run.sh"), &cfg).await,
            Err(ValidationError::Security(SecurityViolation::ForbiddenExtension(_)))
        ));
        assert!(matches!(
            g.check(&file("big.csv"), &cfg).await,
            Err(ValidationError::Security(SecurityViolation::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn missing_file_and_headers_are_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "partial.csv", "sku,price\nA,1\n");
        let g = gate(dir.path());
        let cfg = JobConfiguration::defaults();

        assert!(matches!(
            g.check(&file("nope.csv"), &cfg).await,
            Err(ValidationError::Unavailable(_))
        ));
        assert_eq!(
            g.check(&file("partial.csv"), &cfg).await,
            Err(ValidationError::MissingHeaders(vec!["qty".into()]))
        );
    }

    #[tokio::test]
    async fn header_check_matches_what_the_import_reads() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "spaced.csv", "\n\r\nsku,qty\nA,1\n");
        write(dir.path(), "excel.csv", "\u{feff}sku,qty\r\nA,1\r\n");
        write(dir.path(), "blank.csv", "\n\n");
        let g = gate(dir.path());
        let cfg = JobConfiguration::defaults();

        g.check(&file("spaced.csv"), &cfg).await.unwrap();
        g.check(&file("excel.csv"), &cfg).await.unwrap();
        assert_eq!(
            g.check(&file("blank.csv"), &cfg).await,
            Err(ValidationError::MissingHeaders(vec!["sku".into(), "qty".into()]))
        );
    }

    #[tokio::test]
    async fn pipeline_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stock.csv", "sku,qty\n");
        let stages: Vec<Arc<dyn PreflightStage>> = vec![
            Arc::new(ConfigSchemaStage::new(ConfigSchema::framework())),
            Arc::new(gate(dir.path())),
        ];
        let bad_cfg = JobConfiguration::new();
        let err = run_preflight(&stages, &file("stock.csv"), &bad_cfg).await.unwrap_err();
        assert!(matches!(err, ValidationError::MissingKey(_)));

        run_preflight(&stages, &file("stock.csv"), &JobConfiguration::defaults())
            .await
            .unwrap();
    }
}
