//! Process-wide metrics registry: named atomic counters.
//!
//! Counters are cheap to bump from any thread and are surfaced through the
//! per-service stats RPCs and the daemon's health endpoint. Names are
//! dot-separated, e.g. `bus.events_dropped` or `scheduler.rollbacks`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A single named counter. Clones share the same underlying cell.
#[derive(Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    /// Add `n` to the counter.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of named counters shared across the pipeline.
pub struct Metrics {
    counters: DashMap<String, Counter>,
}

impl Metrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Get or create the counter with the given name.
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(c) = self.counters.get(name) {
            return c.value().clone();
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Counter(Arc::new(AtomicU64::new(0))))
            .value()
            .clone()
    }

    /// Read a counter without creating it. Returns 0 for unknown names.
    pub fn value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.value().get()).unwrap_or(0)
    }

    /// Snapshot all counters, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|r| (r.key().clone(), r.value().get()))
            .collect()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_by_name() {
        let metrics = Metrics::new();
        let a = metrics.counter("bus.events_dropped");
        let b = metrics.counter("bus.events_dropped");
        a.add(3);
        b.inc();
        assert_eq!(metrics.value("bus.events_dropped"), 4);
        assert_eq!(metrics.value("unknown"), 0);
    }

    #[test]
    fn snapshot_is_sorted() {
        let metrics = Metrics::new();
        metrics.counter("b").inc();
        metrics.counter("a").inc();
        let snap = metrics.snapshot();
        let names: Vec<_> = snap.keys().cloned().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
