//! Tracing/logging initialization.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line (production default)
    #[default]
    Json,
    /// Human-readable, for local development
    Pretty,
}

impl LogFormat {
    /// Parse the `CONDUCTOR_LOG_FORMAT` style value; unknown values fall back to JSON.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "human" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "CONDUCTOR_LOG_FORMAT";

impl LogFormat {
    /// Format named by [`LOG_FORMAT_ENV`]; JSON when unset.
    pub fn from_env() -> Self {
        Self::from_setting(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }

    fn from_setting(value: Option<&str>) -> Self {
        value.map(Self::from_name).unwrap_or_default()
    }
}

/// Initialize tracing/logging for the process in the format named by
/// `CONDUCTOR_LOG_FORMAT` (JSON by default).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Initialize tracing/logging with an explicit format, filtered by `RUST_LOG`
/// (default `info`).
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_parse_leniently() {
        assert_eq!(LogFormat::from_name("Pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_name("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_name("whatever"), LogFormat::Json);
    }

    #[test]
    fn unset_format_defaults_to_json() {
        assert_eq!(LogFormat::from_setting(None), LogFormat::Json);
        assert_eq!(LogFormat::from_setting(Some("text")), LogFormat::Pretty);
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init_with(LogFormat::Pretty);
    }
}
