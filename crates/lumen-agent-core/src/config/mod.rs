//! Agent configuration.
//!
//! Configuration sources are applied in order, later overriding earlier:
//!
//! 1. Hard-coded defaults
//! 2. Deserialized config (the host may load JSON/YAML into [`AgentConfig`])
//! 3. `LUMEN_*` environment variables
//!
//! Invalid environment values are logged and ignored rather than failing
//! startup; [`AgentConfig::validate`] catches values that would break the
//! pipeline outright.

pub mod log_level;

use std::time::Duration;

use serde::Deserialize;
use tracing::error;

use crate::config::log_level::LogLevel;

/// Default aggregation window length in seconds.
pub const DEFAULT_AGGREGATION_INTERVAL_SECONDS: u64 = 300;

/// Default grace added to the consumer's queue poll, in milliseconds.
pub const DEFAULT_QUEUE_POLL_GRACE_MS: u64 = 1000;

/// Tunable settings for the agent core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Length of one aggregation window, in seconds. Must be positive.
    pub fixed_aggregation_interval_seconds: u64,

    /// Extra wait added to the consumer's queue poll past the window close
    /// time. A heuristic that lets stragglers from the closing window ride
    /// along before the idle path seals it.
    pub queue_poll_grace_ms: u64,

    /// Name used in consumer lifecycle log lines.
    pub consumer_task_name: String,

    /// Verbosity of the agent's own logging.
    pub log_level: LogLevel,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            fixed_aggregation_interval_seconds: DEFAULT_AGGREGATION_INTERVAL_SECONDS,
            queue_poll_grace_ms: DEFAULT_QUEUE_POLL_GRACE_MS,
            consumer_task_name: "lumen-transaction-aggregator".to_string(),
            log_level: LogLevel::default(),
        }
    }
}

/// Configuration that would break the pipeline outright.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The aggregation interval is zero; windows would never advance.
    #[error("fixed_aggregation_interval_seconds must be positive")]
    ZeroAggregationInterval,
}

impl AgentConfig {
    /// Builds a config from defaults overridden by `LUMEN_*` environment
    /// variables.
    ///
    /// Recognized variables: `LUMEN_AGGREGATION_INTERVAL_SECONDS`,
    /// `LUMEN_QUEUE_POLL_GRACE_MS`, `LUMEN_CONSUMER_TASK_NAME`,
    /// `LUMEN_LOG_LEVEL`. Unparsable values are logged and skipped.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(interval) = env_u64("LUMEN_AGGREGATION_INTERVAL_SECONDS") {
            config.fixed_aggregation_interval_seconds = interval;
        }
        if let Some(grace) = env_u64("LUMEN_QUEUE_POLL_GRACE_MS") {
            config.queue_poll_grace_ms = grace;
        }
        if let Ok(name) = std::env::var("LUMEN_CONSUMER_TASK_NAME") {
            let name = name.trim();
            if !name.is_empty() {
                config.consumer_task_name = name.to_string();
            }
        }
        if let Ok(level) = std::env::var("LUMEN_LOG_LEVEL") {
            match level.parse() {
                Ok(level) => config.log_level = level,
                Err(parse_error) => error!("LUMEN_LOG_LEVEL: {parse_error}, keeping default"),
            }
        }
        config
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fixed_aggregation_interval_seconds == 0 {
            return Err(ConfigError::ZeroAggregationInterval);
        }
        Ok(())
    }

    /// Window length in milliseconds.
    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn aggregation_interval_millis(&self) -> i64 {
        (self.fixed_aggregation_interval_seconds * 1000) as i64
    }

    /// Queue poll grace as a [`Duration`].
    #[must_use]
    pub fn queue_poll_grace(&self) -> Duration {
        Duration::from_millis(self.queue_poll_grace_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            error!("{key}: '{raw}' is not a non-negative integer, keeping default");
            None
        },
    }
}
