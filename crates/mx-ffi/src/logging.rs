//! Logging setup for embedders of the C library.
//!
//! The core crates only emit `tracing` events; installing a subscriber is
//! left to whoever owns the process. C callers get one through
//! `mx_init_logging`.
//!
//! - `RUST_LOG`: full tracing filter, takes precedence
//! - `MX_LOG_LEVEL`: error, warn, info, debug or trace
//! - `MX_LOG_FORMAT`: `human` or `json`

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "warn";
const LOG_LEVEL_ENV: &str = "MX_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "MX_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),
    #[error("failed to install subscriber: {0}")]
    InitFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `info` or `mx_offload=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Human,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError> {
        let mut config = Self::default();
        if let Some(rust_log) = lookup("RUST_LOG") {
            config.filter = rust_log;
        } else if let Some(level) = lookup(LOG_LEVEL_ENV) {
            config.filter = level_directive(&level)
                .ok_or(LoggingError::InvalidLogLevel(level))?
                .to_string();
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            config.format =
                LogFormat::parse(&format).ok_or(LoggingError::InvalidLogFormat(format))?;
        }
        Ok(config)
    }
}

fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_lowercase().as_str() {
        "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

/// Install the global subscriber from the environment.
///
/// Idempotent: only the first successful call has any effect.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let config = LoggingConfig::from_env()?;
    init_with_config(&config)
}

pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_try_init(|| install(config))
        .map(|_| ())
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(false))
            .try_init(),
        LogFormat::Human => registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
    };
    installed.map_err(|e| LoggingError::InitFailed(e.to_string()))
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LoggingConfig::default());
        assert_eq!(config.filter, "warn");
    }

    #[test]
    fn test_rust_log_wins() {
        let config = LoggingConfig::from_lookup(lookup(&[
            ("RUST_LOG", "mx_offload=trace"),
            ("MX_LOG_LEVEL", "error"),
        ]))
        .unwrap();
        assert_eq!(config.filter, "mx_offload=trace");
    }

    #[test]
    fn test_level_and_format() {
        let config =
            LoggingConfig::from_lookup(lookup(&[("MX_LOG_LEVEL", "Warning"), ("MX_LOG_FORMAT", "json")]))
                .unwrap();
        assert_eq!(config.filter, "warn");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            LoggingConfig::from_lookup(lookup(&[("MX_LOG_LEVEL", "loud")])),
            Err(LoggingError::InvalidLogLevel(_))
        ));
        assert!(matches!(
            LoggingConfig::from_lookup(lookup(&[("MX_LOG_FORMAT", "xml")])),
            Err(LoggingError::InvalidLogFormat(_))
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let first = init_with_config(&config);
        // Another test binary component may already own the global subscriber.
        if first.is_ok() {
            assert!(is_initialized());
            assert!(init_with_config(&config).is_ok());
        }
    }
}
