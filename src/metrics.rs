//! Metric abstractions for request counters
//!
//! The metric factory is a process-wide collaborator handed in at server
//! construction rather than reached through global state. When no factory
//! is provided the server degrades to the inert implementation; counters
//! are internally synchronized and never gate correctness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A monotonically increasing counter labeled by one dimension
pub trait Counter: Send + Sync {
    /// Adds `delta` to the counter for `label`
    fn add(&self, delta: u64, label: &str);

    /// Adds one to the counter for `label`
    fn inc(&self, label: &str) {
        self.add(1, label);
    }
}

/// Factory for named metrics
pub trait MetricFactory: Send + Sync {
    /// Creates (or returns) the counter registered under `name`
    fn new_counter(&self, name: &'static str, help: &'static str, label_name: &'static str)
        -> Arc<dyn Counter>;
}

/// Factory whose metrics discard every observation
#[derive(Clone, Copy, Debug, Default)]
pub struct InertMetricFactory;

struct InertCounter;

impl Counter for InertCounter {
    fn add(&self, _delta: u64, _label: &str) {}
}

impl MetricFactory for InertMetricFactory {
    fn new_counter(
        &self,
        _name: &'static str,
        _help: &'static str,
        _label_name: &'static str,
    ) -> Arc<dyn Counter> {
        Arc::new(InertCounter)
    }
}

/// In-process factory backed by plain maps, readable for inspection
#[derive(Default)]
pub struct CountingMetricFactory {
    counters: Mutex<HashMap<&'static str, Arc<CountingCounter>>>,
}

impl CountingMetricFactory {
    /// Creates an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of `name` for `label`, or 0
    pub fn value(&self, name: &str, label: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(name).map(|counter| counter.value(label)).unwrap_or(0)
    }
}

impl MetricFactory for CountingMetricFactory {
    fn new_counter(
        &self,
        name: &'static str,
        _help: &'static str,
        _label_name: &'static str,
    ) -> Arc<dyn Counter> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.entry(name).or_insert_with(|| Arc::new(CountingCounter::default())).clone()
    }
}

#[derive(Default)]
struct CountingCounter {
    values: Mutex<HashMap<String, u64>>,
}

impl CountingCounter {
    fn value(&self, label: &str) -> u64 {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(label).copied().unwrap_or(0)
    }
}

impl Counter for CountingCounter {
    fn add(&self, delta: u64, label: &str) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        *values.entry(label.to_string()).or_insert(0) += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_factory_tracks_per_label_values() {
        let factory = CountingMetricFactory::new();
        let counter = factory.new_counter("set_leaves", "leaves written", "map_id");

        counter.add(3, "7");
        counter.inc("7");
        counter.inc("8");

        assert_eq!(factory.value("set_leaves", "7"), 4);
        assert_eq!(factory.value("set_leaves", "8"), 1);
        assert_eq!(factory.value("set_leaves", "9"), 0);
        assert_eq!(factory.value("get_leaves", "7"), 0);
    }

    #[test]
    fn test_same_name_shares_one_counter() {
        let factory = CountingMetricFactory::new();
        let first = factory.new_counter("reqs", "requests", "map_id");
        let second = factory.new_counter("reqs", "requests", "map_id");

        first.inc("7");
        second.inc("7");

        assert_eq!(factory.value("reqs", "7"), 2);
    }

    #[test]
    fn test_inert_factory_discards_everything() {
        let factory = InertMetricFactory;
        let counter = factory.new_counter("reqs", "requests", "map_id");

        counter.add(10, "7");
    }
}
