//! Counter metrics for monotonically increasing values.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter keyed by a single label, such as a shard identifier.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label name.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Increment the counter for a label value.
    pub fn inc(&self, value: &str) {
        // Fast path: label already present
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(value) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let mut counters = self.counters.write();
        counters
            .entry(value.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for a label value.
    pub fn get(&self, value: &str) -> u64 {
        self.counters
            .read()
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all label values with their counts, sorted by label.
    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}
