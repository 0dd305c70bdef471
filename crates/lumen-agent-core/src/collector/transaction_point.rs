//! Transaction point rollups.
//!
//! A [`TransactionPointBuilder`] accumulates completed traces for one
//! (transaction type, transaction name) key inside one aggregation window;
//! [`build`](TransactionPointBuilder::build) seals it into an immutable
//! [`TransactionPoint`] for the repository.

use std::sync::Arc;

use serde::Serialize;

use crate::trace::metric::TraceMetric;
use crate::trace::model::MergedProfile;

/// Metric tree rolled up across traces, matched by operation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedMetric {
    /// Operation name.
    pub name: String,
    /// Sum of totals across merged traces.
    pub total: i64,
    /// Minimum duration seen across merged traces.
    pub min: i64,
    /// Maximum duration seen across merged traces.
    pub max: i64,
    /// Sum of counts across merged traces.
    pub count: i64,
    /// Child rollups; omitted when empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<MergedMetric>,
}

impl MergedMetric {
    fn from_completed(metric: &TraceMetric) -> Self {
        Self {
            name: metric.name().text().to_string(),
            total: metric.total(),
            min: metric.min(),
            max: metric.max(),
            count: metric.count(),
            nested: metric
                .children()
                .iter()
                .map(|child| Self::from_completed(child))
                .collect(),
        }
    }

    fn merge(&mut self, metric: &TraceMetric) {
        self.total += metric.total();
        self.min = self.min.min(metric.min());
        self.max = self.max.max(metric.max());
        self.count += metric.count();
        for child in metric.children() {
            let name = child.name().text();
            if let Some(existing) = self.nested.iter_mut().find(|m| m.name == name) {
                existing.merge(&child);
            } else {
                self.nested.push(Self::from_completed(&child));
            }
        }
    }
}

/// Mutable accumulator for one transaction point.
#[derive(Debug)]
pub struct TransactionPointBuilder {
    total: i64,
    count: i64,
    min: i64,
    max: i64,
    error_count: i64,
    stored_trace_count: i64,
    metrics: Option<MergedMetric>,
    profile: Option<MergedProfile>,
}

impl Default for TransactionPointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionPointBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: 0,
            count: 0,
            min: i64::MAX,
            max: i64::MIN,
            error_count: 0,
            stored_trace_count: 0,
            metrics: None,
            profile: None,
        }
    }

    /// Folds one completed trace duration in.
    pub fn add(&mut self, duration: i64) {
        self.total += duration;
        self.count += 1;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }

    /// Counts one errored trace.
    pub fn add_to_error_count(&mut self) {
        self.error_count += 1;
    }

    /// Counts one trace whose detail will be persisted.
    pub fn add_to_stored_trace_count(&mut self) {
        self.stored_trace_count += 1;
    }

    /// Merges a completed trace's metric tree into the rollup.
    pub fn add_to_metrics(&mut self, root_metric: &Arc<TraceMetric>) {
        match &mut self.metrics {
            Some(merged) => merged.merge(root_metric),
            None => self.metrics = Some(MergedMetric::from_completed(root_metric)),
        }
    }

    /// Merges a sampled profile into the rollup.
    pub fn add_to_profile(&mut self, profile: &MergedProfile) {
        match &mut self.profile {
            Some(merged) => merged.merge_from(profile),
            None => self.profile = Some(profile.clone()),
        }
    }

    /// Seals the accumulator into an immutable point stamped with the
    /// window's capture time.
    #[must_use]
    pub fn build(self, capture_time: i64) -> TransactionPoint {
        TransactionPoint {
            capture_time,
            total: self.total,
            count: self.count,
            min: self.min,
            max: self.max,
            error_count: self.error_count,
            stored_trace_count: self.stored_trace_count,
            metrics: self.metrics,
            profile: self.profile,
        }
    }
}

/// Immutable rollup for one (type, transaction name) key over one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPoint {
    /// Wall-clock milliseconds identifying the window.
    pub capture_time: i64,
    /// Sum of trace durations.
    pub total: i64,
    /// Number of traces folded in.
    pub count: i64,
    /// Shortest trace duration.
    pub min: i64,
    /// Longest trace duration.
    pub max: i64,
    /// Traces that carried an error.
    pub error_count: i64,
    /// Traces whose detail will be persisted.
    pub stored_trace_count: i64,
    /// Merged metric tree, absent when no trace carried metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MergedMetric>,
    /// Merged sampled profile, absent unless captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<MergedProfile>,
}
