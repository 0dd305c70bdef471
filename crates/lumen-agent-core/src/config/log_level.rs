//! Agent log level.
//!
//! Parsed case-insensitively from configuration or the `LUMEN_LOG_LEVEL`
//! environment variable; invalid values fall back to the default (`Info`)
//! with an error logged rather than failing agent startup.

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use tracing::error;
use tracing_core::LevelFilter;

/// Verbosity of the agent's own logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Serious failures only.
    Error,
    /// Failures plus hazardous conditions.
    Warn,
    /// Normal operational events. The default.
    #[default]
    Info,
    /// Diagnostic detail.
    Debug,
    /// Extremely verbose tracing.
    Trace,
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl LogLevel {
    /// Converts to the `tracing` filter used when installing the
    /// subscriber.
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_else(|parse_error| {
            error!("{parse_error}, using default log level");
            LogLevel::default()
        }))
    }
}
