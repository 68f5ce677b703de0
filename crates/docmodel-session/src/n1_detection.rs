//! N+1 detection for lazy relations.
//!
//! Resolving a lazy relation one owner at a time issues one store query per
//! owner. When a unit of work has detection enabled, every lazy resolution
//! through it is counted per `(owner type, property)` pair and a warning is
//! logged once the count reaches the threshold.
//!
//! ```ignore
//! uow.enable_n1_detection(3);
//!
//! // Warns on the third order:
//! for order in &orders {
//!     customer_of(order).resolve(&cx, order, &uow).await;
//! }
//!
//! // One query instead:
//! LazyOne::load_batch(&cx, &orders, customer_of, &uow).await;
//! ```

use std::collections::HashMap;

/// Counts lazy relation loads per `(owner type, property)`.
#[derive(Debug, Clone)]
pub struct N1QueryTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    enabled: bool,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate view of a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct N1Stats {
    pub total_loads: usize,
    /// Distinct `(owner type, property)` pairs that were loaded lazily.
    pub relations_loaded: usize,
    /// Pairs at or above the threshold.
    pub potential_n1: usize,
}

impl N1QueryTracker {
    /// A tracker with the default threshold of 3.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            threshold: 3,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Record one lazy load. Returns `true` when this load crossed the threshold.
    pub fn record_load(&mut self, owner: &'static str, property: &'static str) -> bool {
        if !self.enabled {
            return false;
        }

        let count = self.counts.entry((owner, property)).or_insert(0);
        *count += 1;
        let count = *count;

        tracing::trace!(target: "docmodel::n1", owner, property, count, "lazy relation load");

        if count == self.threshold {
            tracing::warn!(
                target: "docmodel::n1",
                owner,
                property,
                loads = count,
                threshold = self.threshold,
                "N+1 load pattern detected; consider LazyOne::load_batch or LazyMany::load_batch"
            );
            return true;
        }
        false
    }

    /// Forget every recorded load.
    pub fn reset(&mut self) {
        self.counts.clear();
    }

    #[must_use]
    pub fn count_for(&self, owner: &str, property: &str) -> usize {
        self.counts
            .iter()
            .find(|((o, p), _)| *o == owner && *p == property)
            .map_or(0, |(_, c)| *c)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relations_loaded: self.counts.len(),
            potential_n1: self.counts.values().filter(|c| **c >= self.threshold).count(),
        }
    }
}

// ============================================================================
// N1DetectionScope
// ============================================================================

/// Logs what happened between its creation and [`finish`](Self::finish).
///
/// ```ignore
/// let scope = N1DetectionScope::new(uow.n1_stats().unwrap_or_default(), 3);
/// render_orders(&cx, &uow).await;
/// scope.finish(&uow.n1_stats().unwrap_or_default());
/// ```
#[derive(Debug)]
pub struct N1DetectionScope {
    initial: N1Stats,
    threshold: usize,
    verbose: bool,
}

impl N1DetectionScope {
    #[must_use]
    pub fn new(initial: N1Stats, threshold: usize) -> Self {
        tracing::debug!(target: "docmodel::n1", threshold, "N+1 detection scope started");
        Self {
            initial,
            threshold,
            verbose: false,
        }
    }

    #[must_use]
    pub fn from_tracker(tracker: &N1QueryTracker) -> Self {
        Self::new(tracker.stats(), tracker.threshold())
    }

    /// Log at info level even when nothing was found.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Compare against `current` and log a summary. Returns the newly detected patterns.
    pub fn finish(&self, current: &N1Stats) -> usize {
        let loads = current.total_loads.saturating_sub(self.initial.total_loads);
        let relations = current
            .relations_loaded
            .saturating_sub(self.initial.relations_loaded);
        let detected = current.potential_n1.saturating_sub(self.initial.potential_n1);

        if detected > 0 {
            tracing::warn!(
                target: "docmodel::n1",
                potential_n1 = detected,
                loads,
                relations,
                threshold = self.threshold,
                "N+1 load patterns detected in scope"
            );
        } else if self.verbose {
            tracing::info!(target: "docmodel::n1", loads, relations, "N+1 detection scope clean");
        } else {
            tracing::debug!(target: "docmodel::n1", loads, relations, "N+1 detection scope clean");
        }
        detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let tracker = N1QueryTracker::new();
        assert_eq!(tracker.threshold(), 3);
        assert!(tracker.is_enabled());
        assert_eq!(tracker.stats(), N1Stats::default());
    }

    #[test]
    fn warns_exactly_at_threshold() {
        let mut tracker = N1QueryTracker::new().with_threshold(2);
        assert!(!tracker.record_load("Order", "customer"));
        assert!(tracker.record_load("Order", "customer"));
        assert!(!tracker.record_load("Order", "customer"));
        assert_eq!(tracker.count_for("Order", "customer"), 3);
    }

    #[test]
    fn pairs_are_counted_separately() {
        let mut tracker = N1QueryTracker::new();
        tracker.record_load("Order", "customer");
        tracker.record_load("Order", "customer");
        tracker.record_load("Order", "lines");
        tracker.record_load("Customer", "orders");

        let stats = tracker.stats();
        assert_eq!(stats.total_loads, 4);
        assert_eq!(stats.relations_loaded, 3);
        assert_eq!(stats.potential_n1, 0);
        assert_eq!(tracker.count_for("Order", "lines"), 1);
    }

    #[test]
    fn disabled_tracker_ignores_loads() {
        let mut tracker = N1QueryTracker::new();
        tracker.disable();
        tracker.record_load("Order", "customer");
        assert_eq!(tracker.count_for("Order", "customer"), 0);
        tracker.enable();
        tracker.record_load("Order", "customer");
        assert_eq!(tracker.count_for("Order", "customer"), 1);
    }

    #[test]
    fn reset_clears_counts() {
        let mut tracker = N1QueryTracker::new().with_threshold(1);
        tracker.record_load("Order", "customer");
        assert_eq!(tracker.stats().potential_n1, 1);
        tracker.reset();
        assert_eq!(tracker.stats(), N1Stats::default());
    }

    #[test]
    fn scope_reports_only_new_patterns() {
        let mut tracker = N1QueryTracker::new().with_threshold(2);
        tracker.record_load("Order", "customer");
        tracker.record_load("Order", "customer");
        let scope = N1DetectionScope::from_tracker(&tracker).verbose();

        tracker.record_load("Order", "lines");
        assert_eq!(scope.finish(&tracker.stats()), 0);
        tracker.record_load("Order", "lines");
        assert_eq!(scope.finish(&tracker.stats()), 1);
    }
}
