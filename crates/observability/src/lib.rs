//! Tracing/logging setup shared by every binary in the workspace.

use serde::Deserialize;

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Output format of the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line (default; what log shippers expect).
    #[default]
    Json,
    /// Human-readable multi-field lines for local runs.
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initialize process-wide observability with JSON logs.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize process-wide observability with an explicit log format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats_case_insensitively() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        init();
        init_with(LogFormat::Pretty);
    }
}
