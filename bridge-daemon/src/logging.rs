//! Logging setup for the bridge daemon.
//!
//! Library crates only emit `tracing` events; this module decides where they
//! go. The mode comes from the command line or `BRIDGE_LOG_MODE`, the filter
//! from `BRIDGE_LOG_LEVEL`, then `RUST_LOG`, then the mode's default level.

use std::str::FromStr;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable selecting the logging mode.
pub const LOG_MODE_ENV: &str = "BRIDGE_LOG_MODE";

/// Environment variable overriding the log filter.
pub const LOG_LEVEL_ENV: &str = "BRIDGE_LOG_LEVEL";

/// Where and how log events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber installed, every event is dropped
    Silent,
    /// Compact stderr output
    Development,
    /// Verbose output with thread ids and source locations
    Debug,
    /// One JSON object per line, for log shippers
    Json,
}

impl FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(LoggingMode::Silent),
            "development" | "dev" => Ok(LoggingMode::Development),
            "debug" => Ok(LoggingMode::Debug),
            "json" => Ok(LoggingMode::Json),
            other => Err(LoggingError::InvalidMode(other.to_string())),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid logging mode '{0}' (expected silent, development, debug or json)")]
    InvalidMode(String),

    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),
}

/// Install the global subscriber for `mode`.
///
/// Must be called once, before the bridge starts. A second call fails with
/// [`LoggingError::TracingInit`].
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter("info")?;
            Registry::default()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .compact(),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let filter = create_env_filter("debug")?;
            Registry::default()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Json => {
            let filter = create_env_filter("info")?;
            Registry::default()
                .with(fmt::layer().json().with_current_span(false))
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize logging from `BRIDGE_LOG_MODE`.
///
/// Unset means [`LoggingMode::Development`]; an unknown value is an error so
/// a typo does not silently turn logging off.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_logging(mode_from_env(LoggingMode::Development)?)
}

/// Read `BRIDGE_LOG_MODE`, falling back to `default` when it is unset.
pub fn mode_from_env(default: LoggingMode) -> Result<LoggingMode, LoggingError> {
    match std::env::var(LOG_MODE_ENV) {
        Ok(value) => value.parse(),
        Err(_) => Ok(default),
    }
}

fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var(LOG_LEVEL_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives).map_err(|_| LoggingError::InvalidFilter(directives))
}
