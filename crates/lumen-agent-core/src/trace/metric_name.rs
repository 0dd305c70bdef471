//! Interned metric names.
//!
//! Every timed operation is identified by a [`MetricName`]. The registry
//! guarantees one instance per textual name, so the hot path can compare and
//! hash names by a small integer id instead of hashing strings on every
//! nested-metric lookup.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// An interned operation name.
///
/// Cloning is an `Arc` bump. Equality and hashing use the registry-assigned
/// id only; two `MetricName`s are equal exactly when they came from the same
/// registry entry.
#[derive(Clone)]
pub struct MetricName(Arc<MetricNameInner>);

struct MetricNameInner {
    id: u32,
    text: Box<str>,
}

impl MetricName {
    /// The textual name as passed to [`MetricNameRegistry::name_for`].
    #[must_use]
    pub fn text(&self) -> &str {
        &self.0.text
    }

    /// Registry-assigned id, unique per textual name.
    pub(crate) fn id(&self) -> u32 {
        self.0.id
    }
}

impl PartialEq for MetricName {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for MetricName {}

impl std::hash::Hash for MetricName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricName")
            .field("id", &self.0.id)
            .field("text", &self.text())
            .finish()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Process-wide intern table for metric names.
///
/// `name_for` is safe to call concurrently from any thread; the common case
/// of an already-interned name is a single lock-free map read.
#[derive(Debug, Default)]
pub struct MetricNameRegistry {
    names: DashMap<Box<str>, MetricName>,
    next_id: AtomicU32,
}

impl MetricNameRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unique [`MetricName`] for `text`, interning it on first
    /// use.
    pub fn name_for(&self, text: &str) -> MetricName {
        if let Some(existing) = self.names.get(text) {
            return existing.clone();
        }
        self.name_for_slow(text)
    }

    #[cold]
    fn name_for_slow(&self, text: &str) -> MetricName {
        // Entry API re-checks under the shard lock so concurrent callers
        // racing on the same new name agree on one instance.
        match self.names.entry(Box::from(text)) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let name = MetricName(Arc::new(MetricNameInner {
                    id,
                    text: Box::from(text),
                }));
                e.insert(name.clone());
                name
            },
        }
    }

    /// Number of distinct interned names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no names have been interned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
