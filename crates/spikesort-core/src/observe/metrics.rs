//! # Sorter Metrics
//!
//! Atomic counters and gauges updated on the hoard, train and classify paths.
//! Every update is a single relaxed atomic operation, so the acquisition
//! thread never blocks on metrics.
//!
//! ```rust
//! use spikesort_core::observe::SorterMetrics;
//!
//! let metrics = SorterMetrics::new();
//! metrics.spikes_classified.inc_by(128);
//! metrics.total_units.set(6);
//! assert!(metrics.to_prometheus().contains("spikesort_total_units 6"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Value that can go up and down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram. Sums are kept in thousandths.
#[derive(Debug)]
pub struct Histogram {
    boundaries: Vec<f64>,
    /// One count per boundary plus the overflow bucket
    buckets: Vec<AtomicU64>,
    sum_milli: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(boundaries: Vec<f64>) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            boundaries,
            buckets,
            sum_milli: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets suited to training pass durations in milliseconds.
    pub fn training_ms() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value < b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_milli
            .fetch_add((value.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }
}

/// Counters and gauges of one sorter instance.
#[derive(Debug)]
pub struct SorterMetrics {
    /// Spikes admitted to the training reservoir
    pub spikes_hoarded: Counter,
    /// Spikes refused because a reservoir cap was reached
    pub spikes_dropped: Counter,
    /// Spikes with an unknown channel or wrong length
    pub spikes_malformed: Counter,
    /// Spikes assigned to a unit
    pub spikes_classified: Counter,
    /// Spikes on sorted channels rejected as noise
    pub spikes_rejected: Counter,
    /// Completed training passes
    pub training_runs: Counter,
    /// Channels whose fit failed, summed over passes
    pub training_failures: Counter,
    /// Channels in the current model
    pub channels_sorted: Gauge,
    /// Units in the current model
    pub total_units: Gauge,
    /// Wall time of training passes
    pub training_duration_ms: Histogram,
}

impl Default for SorterMetrics {
    fn default() -> Self {
        Self {
            spikes_hoarded: Counter::new(),
            spikes_dropped: Counter::new(),
            spikes_malformed: Counter::new(),
            spikes_classified: Counter::new(),
            spikes_rejected: Counter::new(),
            training_runs: Counter::new(),
            training_failures: Counter::new(),
            channels_sorted: Gauge::new(),
            total_units: Gauge::new(),
            training_duration_ms: Histogram::training_ms(),
        }
    }
}

impl SorterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            spikes_hoarded: self.spikes_hoarded.get(),
            spikes_dropped: self.spikes_dropped.get(),
            spikes_malformed: self.spikes_malformed.get(),
            spikes_classified: self.spikes_classified.get(),
            spikes_rejected: self.spikes_rejected.get(),
            training_runs: self.training_runs.get(),
            training_failures: self.training_failures.get(),
            channels_sorted: self.channels_sorted.get(),
            total_units: self.total_units.get(),
            training_count: self.training_duration_ms.count(),
            training_ms_sum: self.training_duration_ms.sum(),
        }
    }

    /// Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        let counters = [
            ("spikes_hoarded_total", "Spikes admitted to the training reservoir", s.spikes_hoarded),
            ("spikes_dropped_total", "Spikes refused at a reservoir cap", s.spikes_dropped),
            ("spikes_malformed_total", "Spikes with unknown channel or wrong length", s.spikes_malformed),
            ("spikes_classified_total", "Spikes assigned to a unit", s.spikes_classified),
            ("spikes_rejected_total", "Spikes rejected as noise", s.spikes_rejected),
            ("training_runs_total", "Completed training passes", s.training_runs),
            ("training_failures_total", "Channels whose fit failed", s.training_failures),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP spikesort_{name} {help}");
            let _ = writeln!(out, "# TYPE spikesort_{name} counter");
            let _ = writeln!(out, "spikesort_{name} {value}");
        }
        let gauges = [
            ("channels_sorted", "Channels in the current model", s.channels_sorted),
            ("total_units", "Units in the current model", s.total_units),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP spikesort_{name} {help}");
            let _ = writeln!(out, "# TYPE spikesort_{name} gauge");
            let _ = writeln!(out, "spikesort_{name} {value}");
        }

        let h = &self.training_duration_ms;
        let _ = writeln!(out, "# HELP spikesort_training_duration_ms Training pass wall time");
        let _ = writeln!(out, "# TYPE spikesort_training_duration_ms histogram");
        let mut cumulative = 0;
        for (bound, count) in h.boundaries().iter().zip(h.bucket_counts()) {
            cumulative += count;
            let _ = writeln!(out, "spikesort_training_duration_ms_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        let _ = writeln!(out, "spikesort_training_duration_ms_bucket{{le=\"+Inf\"}} {}", h.count());
        let _ = writeln!(out, "spikesort_training_duration_ms_sum {}", h.sum());
        let _ = writeln!(out, "spikesort_training_duration_ms_count {}", h.count());
        out
    }
}

/// Point-in-time copy of [`SorterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub spikes_hoarded: u64,
    pub spikes_dropped: u64,
    pub spikes_malformed: u64,
    pub spikes_classified: u64,
    pub spikes_rejected: u64,
    pub training_runs: u64,
    pub training_failures: u64,
    pub channels_sorted: i64,
    pub total_units: i64,
    pub training_count: u64,
    pub training_ms_sum: f64,
}

impl MetricsSnapshot {
    /// Fraction of classified spikes on sorted channels that were assigned a unit.
    pub fn acceptance_rate(&self) -> f64 {
        let total = self.spikes_classified + self.spikes_rejected;
        if total == 0 {
            0.0
        } else {
            self.spikes_classified as f64 / total as f64
        }
    }

    pub fn avg_training_ms(&self) -> f64 {
        if self.training_count == 0 {
            0.0
        } else {
            self.training_ms_sum / self.training_count as f64
        }
    }
}
