//! Percentile latency tracking using HDR Histogram.
//!
//! This module provides accurate percentile calculation for request latencies
//! using HdrHistogram, which is the industry standard for latency measurement.
//!
//! # Features
//! - P50 (median), P90, P95, P99, P99.9 percentile tracking
//! - Thread-safe concurrent updates
//! - Memory-efficient histogram storage

use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Percentile statistics for a set of latency measurements.
#[derive(Debug, Clone)]
pub struct PercentileStats {
    /// Number of samples
    pub count: u64,

    /// Minimum value (microseconds)
    pub min: u64,

    /// Maximum value (microseconds)
    pub max: u64,

    /// Mean/average value (microseconds)
    pub mean: f64,

    /// 50th percentile - median (microseconds)
    pub p50: u64,

    /// 90th percentile (microseconds)
    pub p90: u64,

    /// 95th percentile (microseconds)
    pub p95: u64,

    /// 99th percentile (microseconds)
    pub p99: u64,

    /// 99.9th percentile (microseconds)
    pub p99_9: u64,
}

impl PercentileStats {
    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p90={:.2}ms, p95={:.2}ms, p99={:.2}ms, p99.9={:.2}ms",
            self.count,
            self.min as f64 / 1000.0,
            self.max as f64 / 1000.0,
            self.mean / 1000.0,
            self.p50 as f64 / 1000.0,
            self.p90 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.p99_9 as f64 / 1000.0,
        )
    }

    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<30} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label,
            self.count,
            self.p50 as f64 / 1000.0,
            self.p90 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.p99_9 as f64 / 1000.0,
            self.mean / 1000.0,
            self.max as f64 / 1000.0,
        )
    }
}

/// Thread-safe percentile tracker.
///
/// Uses HdrHistogram internally for efficient percentile calculation.
/// All latencies are stored in microseconds.
pub struct PercentileTracker {
    /// HDR Histogram for efficient percentile calculation
    /// Tracks latencies from 1 microsecond to 60 seconds with 3 significant digits
    histogram: Arc<Mutex<Histogram<u64>>>,
}

impl PercentileTracker {
    /// Create a new percentile tracker.
    ///
    /// Configures histogram to track latencies from 1μs to 60 seconds
    /// with 3 significant digits of precision.
    pub fn new() -> Self {
        // Create histogram that can track 1μs to 60s with 3 significant digits
        let histogram =
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("Failed to create histogram");

        Self {
            histogram: Arc::new(Mutex::new(histogram)),
        }
    }

    /// Record a latency measurement in milliseconds.
    ///
    /// # Arguments
    /// * `latency_ms` - Latency in milliseconds
    pub fn record_ms(&self, latency_ms: u64) {
        let latency_us = latency_ms * 1000; // Convert to microseconds
        self.record_us(latency_us);
    }

    /// Record a latency measurement in microseconds.
    ///
    /// # Arguments
    /// * `latency_us` - Latency in microseconds
    pub fn record_us(&self, latency_us: u64) {
        let mut hist = self.histogram.lock().unwrap();

        // Clamp to valid range (1μs to 60s)
        let clamped = latency_us.clamp(1, 60_000_000);

        if let Err(e) = hist.record(clamped) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    /// Get current percentile statistics.
    ///
    /// Returns None if no samples have been recorded.
    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = self.histogram.lock().unwrap();

        if hist.is_empty() {
            return None;
        }

        Some(PercentileStats {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p99_9: hist.value_at_quantile(0.999),
        })
    }

    /// Reset all recorded samples.
    pub fn reset(&self) {
        let mut hist = self.histogram.lock().unwrap();
        hist.clear();
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}

// Global ambient percentile tracker for the application.
//
// This is a supplementary diagnostic only: the Result Aggregator (C1)
// computes the authoritative p95 from its own exact sorted latency list,
// never from this HDR estimate.
lazy_static::lazy_static! {
    /// Global tracker for single request latencies across all tests.
    pub static ref GLOBAL_REQUEST_PERCENTILES: PercentileTracker = PercentileTracker::new();
}

/// Rotate the global histogram tracker.
///
/// Clears histogram data to free memory while keeping the tracker alive.
/// Called by the memory guard under pressure.
pub fn rotate_all_histograms() {
    GLOBAL_REQUEST_PERCENTILES.reset();
}

/// Format percentile statistics as a table.
///
/// # Arguments
/// * `title` - Table title
/// * `stats_map` - Map of label -> statistics
///
/// # Returns
/// Formatted table string
pub fn format_percentile_table(
    title: &str,
    stats_map: &HashMap<String, PercentileStats>,
) -> String {
    if stats_map.is_empty() {
        return format!("## {}\n\nNo data available.\n", title);
    }

    let mut output = String::new();
    output.push_str(&format!("\n## {}\n\n", title));
    output.push_str(&format!(
        "{:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "Label", "Count", "P50", "P90", "P95", "P99", "P99.9", "Mean", "Max"
    ));
    output.push_str(&format!(
        "{:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "", "", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)"
    ));
    output.push_str(&"-".repeat(120));
    output.push('\n');

    // Sort labels for consistent output
    let mut labels: Vec<_> = stats_map.keys().collect();
    labels.sort();

    for label in labels {
        let stats = &stats_map[label];
        output.push_str(&stats.format_table_row(label));
        output.push('\n');
    }

    output
}
