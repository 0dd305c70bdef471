//! Per-trace timing tree.
//!
//! A [`TraceMetric`] records count, total, min and max nanoseconds for one
//! named operation inside one trace, with children for operations nested
//! under it. All timing data is in nanoseconds.
//!
//! Each node is updated by exactly one thread (the trace thread) but may be
//! read at any time by other threads taking in-flight snapshots. The only
//! cross-thread fence on the hot path is `self_nesting_level`: it is written
//! with `Release` after every other field mutation and read with `Acquire`
//! before any other field, so a reader that observes a level write also
//! observes the counter writes that preceded it. The counters themselves use
//! `Relaxed` atomics, which compile to plain loads and stores on mainstream
//! targets; snapshots are therefore cheap but only loosely consistent while
//! the node is active.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::clock::Ticker;
use crate::trace::metric_name::MetricName;
use crate::trace::snapshot::MetricSnapshot;

/// Cursor pointing at the innermost open metric of one trace.
///
/// Only the trace thread reads or writes the cursor, so the lock inside is
/// never contended; it exists because the holder is reachable through nodes
/// shared with snapshot readers.
#[derive(Default)]
pub struct CurrentMetricHolder {
    current: Mutex<Option<Arc<TraceMetric>>>,
}

impl CurrentMetricHolder {
    /// Creates a holder with no open metric.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The innermost open metric, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<TraceMetric>> {
        self.current.lock().clone()
    }

    /// Repoints the cursor.
    pub fn set(&self, metric: Option<Arc<TraceMetric>>) {
        *self.current.lock() = metric;
    }
}

impl std::fmt::Debug for CurrentMetricHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.lock();
        f.debug_struct("CurrentMetricHolder")
            .field("current", &current.as_ref().map(|m| m.name().text()))
            .finish()
    }
}

/// Child bookkeeping, touched only by the trace thread.
#[derive(Default)]
struct ChildTable {
    /// Children keyed by interned name id. Allocates on first insert, so
    /// leaf metrics stay map-free.
    by_name: FxHashMap<u32, Arc<TraceMetric>>,
    /// Cache for the common case of re-entering the same child repeatedly.
    last_child: Option<Arc<TraceMetric>>,
}

/// One node in a trace's timing tree.
pub struct TraceMetric {
    name: MetricName,

    // nanosecond rollover (292 years) is not a concern within one trace
    total: AtomicI64,
    min: AtomicI64,
    max: AtomicI64,
    count: AtomicI64,

    start_tick: AtomicI64,
    self_nesting_level: AtomicU32,

    children: Mutex<ChildTable>,

    // separate list so snapshot readers never touch the child map; appends
    // and copies are serialized by this lock, insertion order is preserved
    children_snapshot: Mutex<Vec<Arc<TraceMetric>>>,

    // parents own children; the back-reference is only followed by the
    // trace thread when an outermost end() pops the cursor
    parent: Option<Weak<TraceMetric>>,

    // handle to the Arc this node lives in, for repointing the cursor
    self_ref: Weak<TraceMetric>,

    holder: Arc<CurrentMetricHolder>,
    ticker: Arc<dyn Ticker>,
}

impl TraceMetric {
    /// Creates the root metric of a trace. The root has no parent and is
    /// not yet started.
    #[must_use]
    pub fn root(
        name: MetricName,
        holder: Arc<CurrentMetricHolder>,
        ticker: Arc<dyn Ticker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| {
            Self::with_parent(name, self_ref.clone(), None, holder, ticker)
        })
    }

    fn with_parent(
        name: MetricName,
        self_ref: Weak<TraceMetric>,
        parent: Option<Weak<TraceMetric>>,
        holder: Arc<CurrentMetricHolder>,
        ticker: Arc<dyn Ticker>,
    ) -> Self {
        Self {
            name,
            total: AtomicI64::new(0),
            min: AtomicI64::new(i64::MAX),
            max: AtomicI64::new(i64::MIN),
            count: AtomicI64::new(0),
            start_tick: AtomicI64::new(0),
            self_nesting_level: AtomicU32::new(0),
            children: Mutex::new(ChildTable::default()),
            children_snapshot: Mutex::new(Vec::new()),
            parent,
            self_ref,
            holder,
            ticker,
        }
    }

    fn self_arc(&self) -> Arc<TraceMetric> {
        // upgrading cannot fail while a caller is reaching this node
        // through its owning Arc
        self.self_ref
            .upgrade()
            .expect("metric is owned by a live Arc")
    }

    /// Interned name of this metric.
    #[must_use]
    pub fn name(&self) -> &MetricName {
        &self.name
    }

    /// Opens this metric at `start_tick` and points the trace cursor at it.
    pub fn start(&self, start_tick: i64) {
        self.start_tick.store(start_tick, Ordering::Relaxed);
        // the level is written after start_tick; its Release pairs with the
        // snapshot reader's Acquire, making start_tick visible
        self.self_nesting_level.fetch_add(1, Ordering::Release);
        self.holder.set(Some(self.self_arc()));
    }

    /// Opens the nested metric `name` under this node, reading the start
    /// tick from the ticker.
    ///
    /// Must be called on the metric currently held by the trace cursor.
    pub fn start_nested(&self, name: &MetricName) -> Arc<TraceMetric> {
        // re-entry into the same named operation collapses into this node;
        // names are interned so id comparison is identity comparison
        if self.name == *name {
            self.self_nesting_level.fetch_add(1, Ordering::Release);
            return self.self_arc();
        }
        let start_tick = self.ticker.now();
        self.start_nested_at_inner(name, start_tick)
    }

    /// Same as [`start_nested`](Self::start_nested) with an explicit start
    /// tick.
    pub fn start_nested_at(&self, name: &MetricName, start_tick: i64) -> Arc<TraceMetric> {
        if self.name == *name {
            self.self_nesting_level.fetch_add(1, Ordering::Release);
            return self.self_arc();
        }
        self.start_nested_at_inner(name, start_tick)
    }

    fn start_nested_at_inner(&self, name: &MetricName, start_tick: i64) -> Arc<TraceMetric> {
        let mut children = self.children.lock();
        // cache hit for the common case of starting the same nested metric
        // over and over
        if let Some(cached) = &children.last_child {
            if *cached.name() == *name {
                let cached = Arc::clone(cached);
                drop(children);
                cached.start(start_tick);
                return cached;
            }
        }
        if let Some(existing) = children.by_name.get(&name.id()) {
            let existing = Arc::clone(existing);
            children.last_child = Some(Arc::clone(&existing));
            drop(children);
            existing.start(start_tick);
            return existing;
        }
        let child = Arc::new_cyclic(|child_ref| {
            Self::with_parent(
                name.clone(),
                child_ref.clone(),
                Some(self.self_ref.clone()),
                Arc::clone(&self.holder),
                Arc::clone(&self.ticker),
            )
        });
        children.by_name.insert(name.id(), Arc::clone(&child));
        children.last_child = Some(Arc::clone(&child));
        drop(children);
        self.children_snapshot.lock().push(Arc::clone(&child));
        child.start(start_tick);
        child
    }

    /// Closes the innermost open entry of this metric at `end_tick`.
    ///
    /// The outermost close records the duration and pops the trace cursor
    /// back to the parent. A call with no open entry is a no-op.
    pub fn end(&self, end_tick: i64) {
        let level = self.self_nesting_level.load(Ordering::Relaxed);
        debug_assert!(level > 0, "end() without matching start()");
        if level == 0 {
            return;
        }
        if level == 1 {
            let duration = end_tick - self.start_tick.load(Ordering::Relaxed);
            self.record(duration);
            self.holder.set(self.parent.as_ref().and_then(Weak::upgrade));
        }
        // counters are mutated before this Release write so the snapshot
        // reader's Acquire on the level makes them visible
        self.self_nesting_level.fetch_sub(1, Ordering::Release);
    }

    /// Closes the innermost open entry, reading the end tick from the
    /// ticker.
    pub fn stop(&self) {
        self.end(self.ticker.now());
    }

    fn record(&self, duration: i64) {
        if duration > self.max.load(Ordering::Relaxed) {
            self.max.store(duration, Ordering::Relaxed);
        }
        if duration < self.min.load(Ordering::Relaxed) {
            self.min.store(duration, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(duration, Ordering::Relaxed);
    }

    /// Accumulated nanoseconds over completed outermost entries. Meaningful
    /// on the trace thread, or after the trace has completed.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Minimum completed duration, or `i64::MAX` when nothing completed yet.
    #[must_use]
    pub fn min(&self) -> i64 {
        self.min.load(Ordering::Relaxed)
    }

    /// Maximum completed duration, or `i64::MIN` when nothing completed yet.
    #[must_use]
    pub fn max(&self) -> i64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Number of completed outermost entries.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Children in first-start order. Meaningful on the trace thread, or
    /// after the trace has completed.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<TraceMetric>> {
        self.children_snapshot.lock().clone()
    }

    /// Captures a loosely consistent snapshot of this subtree.
    ///
    /// Callable from any thread at any time. While the node is active the
    /// in-flight duration is folded in; racing with concurrent updates may
    /// understate `total` but never overstates it, and the in-flight
    /// duration is never negative.
    #[must_use]
    pub fn snapshot(&self) -> MetricSnapshot {
        // the Acquire here pairs with the Release level writes in
        // start()/end(); fields read below are at least as fresh as the
        // level observed
        let active = self.self_nesting_level.load(Ordering::Acquire) > 0;
        let mut snapshot = if active {
            // total is read before start_tick: if an outermost end() lands
            // between the two reads, the stale total understates rather
            // than double-counting the completed entry
            let total = self.total.load(Ordering::Relaxed);
            // start_tick is read before the ticker so curr is never < 0
            let start_tick = self.start_tick.load(Ordering::Relaxed);
            let curr = self.ticker.now() - start_tick;
            if total == 0 {
                MetricSnapshot {
                    name: self.name.text().to_string(),
                    total: curr,
                    min: curr,
                    max: curr,
                    count: 1,
                    active: true,
                    min_active: true,
                    max_active: true,
                    nested_metrics: Vec::new(),
                }
            } else {
                let max = self.max.load(Ordering::Relaxed);
                MetricSnapshot {
                    name: self.name.text().to_string(),
                    total: total + curr,
                    min: self.min.load(Ordering::Relaxed),
                    max: max.max(curr),
                    count: self.count.load(Ordering::Relaxed) + 1,
                    active: true,
                    min_active: false,
                    max_active: curr > max,
                    nested_metrics: Vec::new(),
                }
            }
        } else {
            MetricSnapshot {
                name: self.name.text().to_string(),
                total: self.total.load(Ordering::Relaxed),
                min: self.min.load(Ordering::Relaxed),
                max: self.max.load(Ordering::Relaxed),
                count: self.count.load(Ordering::Relaxed),
                active: false,
                min_active: false,
                max_active: false,
                nested_metrics: Vec::new(),
            }
        };
        let children = self.children_snapshot.lock().clone();
        snapshot.nested_metrics = children.iter().map(|child| child.snapshot()).collect();
        snapshot
    }

    /// Serializes a snapshot of this subtree as JSON to `out`.
    ///
    /// Output errors propagate to the caller; the tree itself is untouched.
    pub fn write_snapshot<W: std::io::Write>(&self, out: W) -> serde_json::Result<()> {
        serde_json::to_writer(out, &self.snapshot())
    }

    #[cfg(test)]
    fn last_child(&self) -> Option<Arc<TraceMetric>> {
        self.children.lock().last_child.clone()
    }
}

impl std::fmt::Debug for TraceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceMetric")
            .field("name", &self.name.text())
            .field("total", &self.total())
            .field("min", &self.min())
            .field("max", &self.max())
            .field("count", &self.count())
            .field(
                "self_nesting_level",
                &self.self_nesting_level.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::trace::metric_name::MetricNameRegistry;

    struct Fixture {
        registry: MetricNameRegistry,
        ticker: Arc<ManualTicker>,
        holder: Arc<CurrentMetricHolder>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: MetricNameRegistry::new(),
                ticker: Arc::new(ManualTicker::default()),
                holder: Arc::new(CurrentMetricHolder::new()),
            }
        }

        fn root(&self, name: &str) -> Arc<TraceMetric> {
            TraceMetric::root(
                self.registry.name_for(name),
                Arc::clone(&self.holder),
                Arc::clone(&self.ticker) as Arc<dyn Ticker>,
            )
        }
    }

    #[test]
    fn simple_nesting_records_both_levels() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(100);
        let b = a.start_nested_at(&fx.registry.name_for("B"), 150);
        b.end(200);
        a.end(300);

        assert_eq!(a.count(), 1);
        assert_eq!(a.total(), 200);
        assert_eq!(a.min(), 200);
        assert_eq!(a.max(), 200);
        assert_eq!(b.count(), 1);
        assert_eq!(b.total(), 50);
        assert_eq!(b.min(), 50);
        assert_eq!(b.max(), 50);

        let children = a.children();
        assert_eq!(children.len(), 1);
        assert!(Arc::ptr_eq(&children[0], &b));
    }

    #[test]
    fn recursive_reentry_collapses_into_one_node() {
        let fx = Fixture::new();
        let a = fx.root("A");
        let name = fx.registry.name_for("A");
        a.start(0);
        let inner = a.start_nested_at(&name, 10);
        assert!(Arc::ptr_eq(&inner, &a));

        inner.end(20);
        // still open, nothing recorded yet
        assert_eq!(a.count(), 0);
        a.end(30);

        assert_eq!(a.count(), 1);
        assert_eq!(a.total(), 30);
        assert_eq!(a.min(), 30);
        assert_eq!(a.max(), 30);
        assert!(a.children().is_empty());
    }

    #[test]
    fn recursive_reentry_keeps_outer_start_tick() {
        let fx = Fixture::new();
        let a = fx.root("A");
        let name = fx.registry.name_for("A");
        a.start(10);
        let inner = a.start_nested_at(&name, 50);
        inner.end(60);
        a.end(100);
        assert_eq!(a.total(), 90);
    }

    #[test]
    fn repeated_child_uses_cache_and_accumulates() {
        let fx = Fixture::new();
        let r = fx.root("R");
        let c_name = fx.registry.name_for("C");
        r.start(0);

        let c1 = r.start_nested_at(&c_name, 0);
        c1.end(10);
        assert!(Arc::ptr_eq(&r.last_child().unwrap(), &c1));

        let c2 = r.start_nested_at(&c_name, 20);
        assert!(Arc::ptr_eq(&c1, &c2));
        c2.end(35);
        assert!(Arc::ptr_eq(&r.last_child().unwrap(), &c2));

        assert_eq!(c2.count(), 2);
        assert_eq!(c2.total(), 25);
        assert_eq!(c2.min(), 10);
        assert_eq!(c2.max(), 15);
        assert_eq!(r.children().len(), 1);
    }

    #[test]
    fn children_keep_first_start_order() {
        let fx = Fixture::new();
        let r = fx.root("R");
        r.start(0);
        for (name, start, end) in [("x", 1, 2), ("y", 3, 4), ("z", 5, 6), ("y", 7, 8)] {
            let child = r.start_nested_at(&fx.registry.name_for(name), start);
            child.end(end);
        }
        let names: Vec<String> = r
            .children()
            .iter()
            .map(|c| c.name().text().to_string())
            .collect();
        assert_eq!(names, ["x", "y", "z"]);
    }

    #[test]
    fn cursor_follows_start_and_end() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(0);
        assert!(Arc::ptr_eq(&fx.holder.get().unwrap(), &a));

        let b = a.start_nested_at(&fx.registry.name_for("B"), 10);
        assert!(Arc::ptr_eq(&fx.holder.get().unwrap(), &b));

        b.end(20);
        assert!(Arc::ptr_eq(&fx.holder.get().unwrap(), &a));

        a.end(30);
        assert!(fx.holder.get().is_none());
    }

    #[test]
    fn sibling_overload_reads_ticker() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.start(100);
        fx.ticker.set(140);
        let b = a.start_nested(&fx.registry.name_for("B"));
        fx.ticker.set(150);
        b.stop();
        assert_eq!(b.total(), 10);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "end() without matching start()")]
    fn unmatched_end_asserts_in_debug() {
        let fx = Fixture::new();
        let a = fx.root("A");
        a.end(10);
    }

    #[test]
    fn totals_agree_with_sum_of_durations() {
        let fx = Fixture::new();
        let r = fx.root("R");
        let name = fx.registry.name_for("op");
        r.start(0);
        let durations = [7, 3, 11, 5];
        let mut tick = 100;
        for d in durations {
            let child = r.start_nested_at(&name, tick);
            child.end(tick + d);
            tick += d + 10;
        }
        let child = &r.children()[0];
        assert_eq!(child.count(), durations.len() as i64);
        assert_eq!(child.total(), durations.iter().sum::<i64>());
        assert_eq!(child.min(), 3);
        assert_eq!(child.max(), 11);
    }
}
