//! # Lumen Agent Core
//!
//! Core of the Lumen application-performance-monitoring agent: the per-trace
//! timing machinery that runs inside every instrumented call, and the
//! aggregation pipeline that rolls completed traces into fixed-interval
//! transaction points.
//!
//! ## Overview
//!
//! - **Hot path** ([`trace`]): instrumentation starts and ends nested
//!   [`trace::TraceMetric`]s on a single trace thread, with per-call
//!   overhead in the tens of nanoseconds. Other threads may snapshot any
//!   in-flight tree at any time without blocking the trace thread.
//! - **Cold path** ([`collector`]): when a trace's root metric closes, the
//!   trace is handed to the [`collector::TransactionAggregator`], which
//!   buckets it into a wall-clock-aligned window and flushes sealed windows
//!   to a host-provided [`collector::TransactionPointRepository`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lumen_agent_core::clock::{SystemClock, SystemTicker, Ticker};
//! use lumen_agent_core::collector::TransactionAggregator;
//! use lumen_agent_core::config::AgentConfig;
//! use lumen_agent_core::trace::{MetricNameRegistry, Trace};
//!
//! # async fn example(repository: Arc<dyn lumen_agent_core::collector::TransactionPointRepository>) {
//! let config = AgentConfig::from_env();
//! let registry = MetricNameRegistry::new();
//! let ticker: Arc<dyn Ticker> = Arc::new(SystemTicker::new());
//! let aggregator = TransactionAggregator::new(&config, repository, Arc::new(SystemClock));
//!
//! let mut trace = Trace::start(
//!     registry.name_for("http request"),
//!     "/checkout",
//!     false,
//!     Arc::clone(&ticker),
//! );
//! let root = Arc::clone(trace.root_metric());
//! let query = root.start_nested(&registry.name_for("jdbc query"));
//! query.stop();
//! trace.finish();
//!
//! let capture_time = aggregator.add(trace, false);
//! let _ = capture_time;
//! # }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

/// Monotonic and wall-clock time sources
pub mod clock;

/// Rollup of completed traces into persisted transaction points
pub mod collector;

/// Configuration from defaults, documents, and environment variables
pub mod config;

/// Logging setup and the agent's log line format
pub mod logger;

/// Per-trace timing trees and in-flight snapshots
pub mod trace;

/// Version of the agent core, reported in diagnostics.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the agent core version at INFO level; call once during host
/// startup after logging is initialized.
pub fn log_build_info() {
    tracing::info!("lumen-agent-core version: {}", AGENT_VERSION);
}
