//! Trace model: one logical top-level request.
//!
//! A [`Trace`] owns the root [`TraceMetric`] of its timing tree, the cursor
//! used by instrumentation to find the innermost open metric, and the
//! metadata the collector folds into transaction points: transaction name,
//! background flag, optional error and optional fine-grained profile.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Ticker;
use crate::trace::metric::{CurrentMetricHolder, TraceMetric};
use crate::trace::metric_name::MetricName;

/// One logical top-level request being timed.
pub struct Trace {
    transaction_name: String,
    background: bool,
    error: Option<String>,
    fine_profile: Option<MergedProfile>,

    holder: Arc<CurrentMetricHolder>,
    root: Arc<TraceMetric>,
    ticker: Arc<dyn Ticker>,

    start_tick: i64,
    duration: i64,
}

impl Trace {
    /// Starts a new trace, opening its root metric at the current tick.
    #[must_use]
    pub fn start(
        root_metric_name: MetricName,
        transaction_name: impl Into<String>,
        background: bool,
        ticker: Arc<dyn Ticker>,
    ) -> Self {
        let holder = Arc::new(CurrentMetricHolder::new());
        let root = TraceMetric::root(root_metric_name, Arc::clone(&holder), Arc::clone(&ticker));
        let start_tick = ticker.now();
        root.start(start_tick);
        Self {
            transaction_name: transaction_name.into(),
            background,
            error: None,
            fine_profile: None,
            holder,
            root,
            ticker,
            start_tick,
            duration: 0,
        }
    }

    /// Closes the root metric at `end_tick` and fixes the trace duration.
    pub fn end(&mut self, end_tick: i64) {
        self.root.end(end_tick);
        self.duration = end_tick - self.start_tick;
    }

    /// Closes the root metric at the current tick.
    pub fn finish(&mut self) {
        self.end(self.ticker.now());
    }

    /// Transaction name used for per-transaction rollups.
    #[must_use]
    pub fn transaction_name(&self) -> &str {
        &self.transaction_name
    }

    /// Overrides the transaction name; instrumentation may refine it after
    /// the trace has started.
    pub fn set_transaction_name(&mut self, transaction_name: impl Into<String>) {
        self.transaction_name = transaction_name.into();
    }

    /// Whether this trace belongs to background work rather than a
    /// user-facing request.
    #[must_use]
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Marks this trace as background or foreground.
    pub fn set_background(&mut self, background: bool) {
        self.background = background;
    }

    /// Error message attached to the trace, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Attaches an error message.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// Fine-grained sampled profile, if one was captured.
    #[must_use]
    pub fn fine_profile(&self) -> Option<&MergedProfile> {
        self.fine_profile.as_ref()
    }

    /// Attaches a sampled profile.
    pub fn set_fine_profile(&mut self, profile: MergedProfile) {
        self.fine_profile = Some(profile);
    }

    /// Root of the timing tree.
    #[must_use]
    pub fn root_metric(&self) -> &Arc<TraceMetric> {
        &self.root
    }

    /// Innermost open metric, for instrumentation entering a nested
    /// operation.
    #[must_use]
    pub fn current_metric(&self) -> Option<Arc<TraceMetric>> {
        self.holder.get()
    }

    /// Tick at which the trace started.
    #[must_use]
    pub fn start_tick(&self) -> i64 {
        self.start_tick
    }

    /// Completed duration in nanoseconds; zero until [`end`](Self::end) has
    /// been called.
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.duration
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("transaction_name", &self.transaction_name)
            .field("background", &self.background)
            .field("error", &self.error)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Sampled stack traces merged into a call tree with sample counts.
///
/// Produced by the stack-sampling layer above this crate; here it is only
/// accumulated and merged into per-transaction rollups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedProfile {
    /// Total number of samples folded into this profile.
    pub sample_count: u64,
    /// Outermost frames, one subtree per distinct root frame.
    pub roots: Vec<ProfileFrame>,
}

/// One frame of a merged profile tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFrame {
    /// Frame label, typically `class.method`.
    pub name: String,
    /// Samples that passed through this frame.
    pub sample_count: u64,
    /// Callee frames.
    pub children: Vec<ProfileFrame>,
}

impl ProfileFrame {
    fn leaf(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sample_count: 0,
            children: Vec::new(),
        }
    }
}

impl MergedProfile {
    /// Creates an empty profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sampled stack into the tree. Frames are ordered outermost
    /// first.
    pub fn add_stack(&mut self, frames: &[&str]) {
        self.sample_count += 1;
        let mut level = &mut self.roots;
        for frame in frames {
            let position = level.iter().position(|f| f.name == *frame);
            let index = match position {
                Some(index) => index,
                None => {
                    level.push(ProfileFrame::leaf(frame));
                    level.len() - 1
                },
            };
            level[index].sample_count += 1;
            level = &mut level[index].children;
        }
    }

    /// Merges another profile into this one, matching frames by name.
    pub fn merge_from(&mut self, other: &MergedProfile) {
        self.sample_count += other.sample_count;
        Self::merge_frames(&mut self.roots, &other.roots);
    }

    fn merge_frames(into: &mut Vec<ProfileFrame>, from: &[ProfileFrame]) {
        for frame in from {
            if let Some(existing) = into.iter_mut().find(|f| f.name == frame.name) {
                existing.sample_count += frame.sample_count;
                Self::merge_frames(&mut existing.children, &frame.children);
            } else {
                into.push(frame.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::trace::metric_name::MetricNameRegistry;

    fn ticker() -> Arc<ManualTicker> {
        Arc::new(ManualTicker::default())
    }

    #[test]
    fn trace_lifecycle_fixes_duration() {
        let registry = MetricNameRegistry::new();
        let ticker = ticker();
        ticker.set(1_000);
        let mut trace = Trace::start(
            registry.name_for("http request"),
            "/checkout",
            false,
            Arc::clone(&ticker) as Arc<dyn Ticker>,
        );
        assert_eq!(trace.duration(), 0);
        assert!(trace.current_metric().is_some());

        ticker.set(4_500);
        trace.finish();
        assert_eq!(trace.duration(), 3_500);
        assert_eq!(trace.root_metric().count(), 1);
        assert_eq!(trace.root_metric().total(), 3_500);
        assert!(trace.current_metric().is_none());
    }

    #[test]
    fn trace_metadata_mutators() {
        let registry = MetricNameRegistry::new();
        let mut trace = Trace::start(
            registry.name_for("job"),
            "placeholder",
            true,
            ticker() as Arc<dyn Ticker>,
        );
        trace.set_transaction_name("nightly-reindex");
        trace.set_error("index corrupted");
        assert!(trace.is_background());
        assert_eq!(trace.transaction_name(), "nightly-reindex");
        assert_eq!(trace.error(), Some("index corrupted"));
    }

    #[test]
    fn profile_add_stack_builds_tree() {
        let mut profile = MergedProfile::new();
        profile.add_stack(&["main", "handle", "query"]);
        profile.add_stack(&["main", "handle", "render"]);
        profile.add_stack(&["main", "idle"]);

        assert_eq!(profile.sample_count, 3);
        assert_eq!(profile.roots.len(), 1);
        let main = &profile.roots[0];
        assert_eq!(main.sample_count, 3);
        assert_eq!(main.children.len(), 2);
        let handle = &main.children[0];
        assert_eq!(handle.sample_count, 2);
        assert_eq!(handle.children.len(), 2);
    }

    #[test]
    fn profile_merge_matches_frames_by_name() {
        let mut left = MergedProfile::new();
        left.add_stack(&["main", "handle"]);
        let mut right = MergedProfile::new();
        right.add_stack(&["main", "flush"]);
        right.add_stack(&["main", "handle"]);

        left.merge_from(&right);
        assert_eq!(left.sample_count, 3);
        let main = &left.roots[0];
        assert_eq!(main.sample_count, 3);
        let handle = main.children.iter().find(|f| f.name == "handle").unwrap();
        assert_eq!(handle.sample_count, 2);
        let flush = main.children.iter().find(|f| f.name == "flush").unwrap();
        assert_eq!(flush.sample_count, 1);
    }
}
