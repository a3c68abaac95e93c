//! Process settings, read from the environment with defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use bulkops_observability::LogFormat;

use crate::jobs::broadcast::DEFAULT_CHANNEL;
use crate::jobs::diagnostics::DiagnosticsSettings;
use crate::jobs::progress::ProgressSettings;
use crate::jobs::runner::RunnerSettings;
use crate::jobs::validation::ImportPolicy;
use crate::rate_limit::{RateLimitRule, RateLimitSettings};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a runner process needs to start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub environment: String,
    /// Postgres URL; the in-memory record store is used when absent.
    pub database_url: Option<String>,
    /// Redis URL; in-memory progress snapshots and broadcasts are used when absent.
    pub redis_url: Option<String>,
    pub log_format: LogFormat,
    /// Broadcast channel name.
    pub channel: String,
    pub runner: RunnerSettings,
    pub progress: ProgressSettings,
    pub rate_limit: RateLimitSettings,
    pub diagnostics: DiagnosticsSettings,
    pub import: ImportPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            database_url: None,
            redis_url: None,
            log_format: LogFormat::default(),
            channel: DEFAULT_CHANNEL.to_string(),
            runner: RunnerSettings::default(),
            progress: ProgressSettings::default(),
            rate_limit: RateLimitSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
            import: ImportPolicy::default(),
        }
    }
}

impl Settings {
    /// Read `BULKOPS_*`, `DATABASE_URL` and `REDIS_URL` from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(env) = get("BULKOPS_ENV") {
            s.environment = env;
        } else {
            warn!("BULKOPS_ENV not set; using `development`");
        }
        s.runner.environment = s.environment.clone();
        s.database_url = get("DATABASE_URL");
        s.redis_url = get("REDIS_URL");
        if let Some(channel) = get("BULKOPS_CHANNEL") {
            s.channel = channel;
        }
        if let Some(raw) = get("BULKOPS_LOG_FORMAT") {
            s.log_format = LogFormat::parse(&raw).ok_or_else(|| SettingsError::Invalid {
                key: "BULKOPS_LOG_FORMAT",
                value: raw.clone(),
                reason: "expected `json` or `pretty`".to_string(),
            })?;
        }

        if let Some(n) = parse::<usize>(&get, "BULKOPS_MAX_CONCURRENT_JOBS")? {
            if n == 0 {
                return Err(SettingsError::Invalid {
                    key: "BULKOPS_MAX_CONCURRENT_JOBS",
                    value: n.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            s.runner.max_concurrent_jobs = n;
        }
        if let Some(secs) = parse::<u64>(&get, "BULKOPS_CHUNK_TIMEOUT_SECS")? {
            s.runner.chunk_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&get, "BULKOPS_STORE_TIMEOUT_SECS")? {
            s.runner.store_timeout = Duration::from_secs(secs);
            s.progress.store_timeout = s.runner.store_timeout;
        }
        if let Some(n) = parse::<u32>(&get, "BULKOPS_MAX_RETRIES")? {
            s.runner.retry.max_attempts = n;
        }
        if let Some(n) = parse::<u32>(&get, "BULKOPS_BROADCAST_EVERY_CHUNKS")? {
            s.progress.broadcast_every_chunks = n.max(1);
        }

        let limit = parse::<u32>(&get, "BULKOPS_SUBMIT_LIMIT")?;
        let window = parse::<u64>(&get, "BULKOPS_SUBMIT_WINDOW_SECS")?;
        if limit.is_some() || window.is_some() {
            let default = RateLimitRule::default();
            s.rate_limit.default_rule = RateLimitRule::new(
                limit.unwrap_or(default.limit),
                window.map(Duration::from_secs).unwrap_or(default.window),
            );
        }

        if let Some(root) = get("BULKOPS_IMPORT_ROOT") {
            s.import.allowed_root = PathBuf::from(root);
        }
        if let Some(bytes) = parse::<u64>(&get, "BULKOPS_IMPORT_MAX_BYTES")? {
            s.import.max_size_bytes = bytes;
        }
        if let Some(rate) = parse::<f64>(&get, "BULKOPS_ERROR_RATE_THRESHOLD")? {
            s.diagnostics.error_rate_threshold = rate;
        }
        if let Some(secs) = parse::<u64>(&get, "BULKOPS_STALE_AFTER_SECS")? {
            s.diagnostics.stale_after = Duration::from_secs(secs);
        }
        Ok(s)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| SettingsError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
