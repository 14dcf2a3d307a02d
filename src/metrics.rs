//! Metrics for monitoring the cache node.
//!
//! Prometheus-style counters and gauges backed by atomics, with a
//! plain-text exposition for the front-end `/metrics` endpoint. Metrics
//! are per group; the binary renders one block per registered group.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write;
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

/// A counter with labels for dimensional metrics.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Increment the counter with the given labels.
    pub fn inc(&self, labels: [&str; N]) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for specific labels.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all values with their labels.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Metrics tracked for one cache group.
#[derive(Debug)]
pub struct CacheMetrics {
    /// Total GET requests.
    pub requests: Counter,
    /// Requests served from the local store.
    pub hits: Counter,
    /// Requests not present in the local store.
    pub misses: Counter,
    /// Loads from the backing source.
    pub loads: Counter,
    /// Source loads that failed (excluding authoritative "not found").
    pub load_failures: Counter,
    /// Remote fetch outcomes, labeled by peer address and status.
    pub peer_fetches: LabeledCounter<2>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            requests: Counter::new("shoal_requests_total", "Total cache GET requests"),
            hits: Counter::new("shoal_hits_total", "GET requests served from the local store"),
            misses: Counter::new("shoal_misses_total", "GET requests missing the local store"),
            loads: Counter::new("shoal_loads_total", "Loads from the backing source"),
            load_failures: Counter::new("shoal_load_failures_total", "Failed source loads"),
            peer_fetches: LabeledCounter::new(
                "shoal_peer_fetches_total",
                "Remote fetch outcomes by peer and status",
                ["peer", "status"],
            ),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time statistics for one cache group.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    /// Callers collapsed into another caller's in-flight operation.
    pub dedup_suppressed: u64,
    /// Entries in the local store.
    pub entries: u64,
    /// Weighted size of the local store in bytes.
    pub bytes: u64,
}

impl CacheStats {
    /// Fraction of requests served from the local store.
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

/// Render a group's metrics in Prometheus text exposition format.
pub fn render_group(out: &mut String, group: &str, metrics: &CacheMetrics, stats: &CacheStats) {
    let mut line = |name: &str, value: u64| {
        let _ = writeln!(out, "{}{{group=\"{}\"}} {}", name, group, value);
    };
    line(metrics.requests.name(), stats.requests);
    line(metrics.hits.name(), stats.hits);
    line(metrics.misses.name(), stats.misses);
    line(metrics.loads.name(), stats.loads);
    line(metrics.load_failures.name(), stats.load_failures);
    line("shoal_dedup_suppressed_total", stats.dedup_suppressed);
    line("shoal_store_entries", stats.entries);
    line("shoal_store_bytes", stats.bytes);

    for (labels, value) in metrics.peer_fetches.get_all() {
        let _ = writeln!(
            out,
            "{}{{group=\"{}\",peer=\"{}\",status=\"{}\"}} {}",
            metrics.peer_fetches.name(),
            group,
            labels[0],
            labels[1],
            value
        );
    }
}
