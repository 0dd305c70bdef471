//! Log formatting for the agent's own output.
//!
//! The agent runs embedded inside a host application, so its log lines carry
//! a fixed `LUMEN_AGENT` prefix to keep them distinguishable from the host's
//! own logging:
//!
//! ```text
//! LUMEN_AGENT | INFO | aggregator started interval_seconds=300
//! LUMEN_AGENT | ERROR | flush{window=1712000100000}: failed to store transaction points
//! ```
//!
//! Active span names are included from root to current, with their fields in
//! curly braces.

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

use crate::config::log_level::LogLevel;

/// Event formatter producing `LUMEN_AGENT | LEVEL | spans: message` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "LUMEN_AGENT | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber with the agent formatter at the given
/// level.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init(log_level: LogLevel) {
    let subscriber = tracing_subscriber::fmt()
        .event_format(Formatter)
        .with_max_level(log_level.as_level_filter())
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("logging already initialized, keeping existing subscriber");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(LogLevel::Debug);
        init(LogLevel::Error);
        tracing::info!("still alive");
    }
}
