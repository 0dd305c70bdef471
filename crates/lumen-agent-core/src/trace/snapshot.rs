//! Reader-facing snapshot envelope for trace metrics.
//!
//! [`MetricSnapshot`] is the wire shape handed to in-flight trace viewers:
//!
//! ```json
//! { "name": "http request",
//!   "total": 1500, "min": 1500, "max": 1500, "count": 1,
//!   "active": true, "minActive": true, "maxActive": true,
//!   "nestedMetrics": [ ... ] }
//! ```
//!
//! `nestedMetrics` is omitted for leaf metrics. The snapshot is produced by
//! [`TraceMetric::snapshot`](crate::trace::TraceMetric::snapshot); this
//! module only carries the envelope and the writer.

use std::io;

use serde::{Deserialize, Serialize};

use crate::trace::metric::TraceMetric;

/// One node of a snapshot, in the external envelope shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    /// Operation name.
    pub name: String,
    /// Accumulated nanoseconds, including the in-flight entry when active.
    pub total: i64,
    /// Minimum completed duration.
    pub min: i64,
    /// Maximum duration, including the in-flight entry when it exceeds the
    /// completed maximum.
    pub max: i64,
    /// Completed entries, plus one when active.
    pub count: i64,
    /// Whether the metric was open when the snapshot was taken.
    pub active: bool,
    /// Whether `min` reflects the in-flight entry.
    pub min_active: bool,
    /// Whether `max` reflects the in-flight entry.
    pub max_active: bool,
    /// Child snapshots in first-start order; omitted when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested_metrics: Vec<MetricSnapshot>,
}

/// Serializes a snapshot of `metric`'s subtree as JSON to `out`.
///
/// Stateless; output errors propagate to the caller and leave the metric
/// tree untouched.
pub fn write_snapshot<W: io::Write>(metric: &TraceMetric, out: W) -> serde_json::Result<()> {
    serde_json::to_writer(out, &metric.snapshot())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{ManualTicker, Ticker};
    use crate::trace::metric::CurrentMetricHolder;
    use crate::trace::metric_name::MetricNameRegistry;

    struct Fixture {
        registry: MetricNameRegistry,
        ticker: Arc<ManualTicker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: MetricNameRegistry::new(),
                ticker: Arc::new(ManualTicker::default()),
            }
        }

        fn root(&self, name: &str) -> Arc<TraceMetric> {
            TraceMetric::root(
                self.registry.name_for(name),
                Arc::new(CurrentMetricHolder::new()),
                Arc::clone(&self.ticker) as Arc<dyn Ticker>,
            )
        }
    }

    #[test]
    fn in_flight_snapshot_of_fresh_metric() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(100);
        fx.ticker.set(250);

        let snap = a.snapshot();
        assert_eq!(snap.total, 150);
        assert_eq!(snap.min, 150);
        assert_eq!(snap.max, 150);
        assert_eq!(snap.count, 1);
        assert!(snap.active);
        assert!(snap.min_active);
        assert!(snap.max_active);
    }

    #[test]
    fn in_flight_snapshot_folds_into_history() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(0);
        a.end(100);

        a.start(200);
        fx.ticker.set(250);
        let snap = a.snapshot();
        assert_eq!(snap.total, 150);
        assert_eq!(snap.min, 100);
        assert_eq!(snap.max, 100);
        assert_eq!(snap.count, 2);
        assert!(snap.active);
        assert!(!snap.min_active);
        assert!(!snap.max_active);

        // once the in-flight entry outlasts the completed maximum it takes
        // over the max field
        fx.ticker.set(550);
        let snap = a.snapshot();
        assert_eq!(snap.total, 450);
        assert_eq!(snap.max, 350);
        assert!(snap.max_active);
    }

    #[test]
    fn inactive_snapshot_reports_counters_verbatim() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(10);
        a.end(25);

        let snap = a.snapshot();
        assert_eq!(snap.total, 15);
        assert_eq!(snap.min, 15);
        assert_eq!(snap.max, 15);
        assert_eq!(snap.count, 1);
        assert!(!snap.active);
        assert!(!snap.min_active);
        assert!(!snap.max_active);
    }

    #[test]
    fn nested_metrics_serialized_recursively() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(0);
        let b = a.start_nested_at(&fx.registry.name_for("B"), 10);
        b.end(30);
        a.end(100);

        let snap = a.snapshot();
        assert_eq!(snap.nested_metrics.len(), 1);
        assert_eq!(snap.nested_metrics[0].name, "B");
        assert_eq!(snap.nested_metrics[0].total, 20);
    }

    #[test]
    fn envelope_uses_camel_case_and_omits_empty_children() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(0);
        a.end(5);

        let mut buf = Vec::new();
        write_snapshot(&a, &mut buf).unwrap();
        let json = String::from_utf8(buf).unwrap();
        assert!(json.contains("\"minActive\":false"));
        assert!(json.contains("\"maxActive\":false"));
        assert!(!json.contains("nestedMetrics"));

        let round_trip: MetricSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(round_trip, a.snapshot());
    }

    #[test]
    fn write_snapshot_propagates_output_errors() {
        struct FailingWriter;
        impl std::io::Write for FailingWriter {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(0);
        a.end(5);
        assert!(write_snapshot(&a, FailingWriter).is_err());
        // the tree is still usable afterwards
        assert_eq!(a.snapshot().total, 5);
    }

    #[test]
    fn concurrent_snapshots_never_see_negative_in_flight_time() {
        let registry = MetricNameRegistry::new();
        let ticker = Arc::new(crate::clock::SystemTicker::new());
        let root = TraceMetric::root(
            registry.name_for("hot"),
            Arc::new(CurrentMetricHolder::new()),
            Arc::clone(&ticker) as Arc<dyn Ticker>,
        );

        let reader_root = Arc::clone(&root);
        let reader = std::thread::spawn(move || {
            for _ in 0..2_000 {
                let snap = reader_root.snapshot();
                assert!(snap.total >= 0, "understated total must stay non-negative");
                assert!(snap.count >= 0);
                if snap.active {
                    assert!(snap.max >= 0);
                }
            }
        });

        for _ in 0..2_000 {
            root.start(ticker.now());
            root.end(ticker.now());
        }
        reader.join().unwrap();

        let snap = root.snapshot();
        assert_eq!(snap.count, 2_000);
        assert!(!snap.active);
    }
}
