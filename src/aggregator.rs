//! Result Aggregator (C1): counters, latency reservoir, per-second buckets,
//! error log, and the final summary. Grounded on the exact finalize formula
//! used by `original_source/backend/load_runner.py::HTTPLoadRunner._finalize`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const MAX_ERROR_LOG: usize = 200;
const MAX_SAMPLE_LOG: usize = 500;
const ERROR_MESSAGE_PREVIEW_BYTES: usize = 4096;

/// One completed request's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_ms: u64,
    /// 0 for a transport error.
    pub http_status: u16,
    pub latency_ms: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub time_ms: u64,
    pub code: u16,
    pub message_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub second: u64,
    pub rps: u64,
    pub avg_rt: f64,
}

/// The final aggregated summary, the shape returned by `GET /test/{id}/status`
/// once completed and sent verbatim in `test_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "successfulRequests")]
    pub successful_requests: u64,
    #[serde(rename = "failedRequests")]
    pub failed_requests: u64,
    #[serde(rename = "successRate")]
    pub success_rate: f64,
    #[serde(rename = "avgResponseTime")]
    pub avg_response_time: f64,
    #[serde(rename = "percentile95")]
    pub percentile95: f64,
    #[serde(rename = "peakRPS")]
    pub peak_rps: f64,
    #[serde(rename = "requestsPerSecond")]
    pub requests_per_second: f64,
    pub duration: f64,
    pub timestamp: String,
    pub codes: HashMap<String, u64>,
    pub errors: Vec<ErrorLogEntry>,
    pub samples: Vec<Sample>,
    pub timeseries: Vec<TimeSeriesPoint>,
}

#[derive(Default)]
struct Inner {
    total: u64,
    passed: u64,
    failed: u64,
    latencies: Vec<u64>,
    codes: HashMap<String, u64>,
    errors: Vec<ErrorLogEntry>,
    samples: Vec<Sample>,
    count_by_second: HashMap<u64, u64>,
    latency_sum_by_second: HashMap<u64, u64>,
    timeseries: Vec<TimeSeriesPoint>,
}

/// The aggregator owned by a single Load Runner. Never shared across tests.
pub struct Aggregator {
    inner: Mutex<Inner>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Records one completed request's outcome.
    pub fn record(&self, sample: Sample) {
        let mut inner = self.inner.lock().unwrap();

        inner.total += 1;
        if sample.ok {
            inner.passed += 1;
        } else {
            inner.failed += 1;
        }

        inner.latencies.push(sample.latency_ms);

        let code_label = sample.http_status.to_string();
        *inner.codes.entry(code_label).or_insert(0) += 1;

        let second = sample.timestamp_ms / 1000;
        *inner.count_by_second.entry(second).or_insert(0) += 1;
        *inner.latency_sum_by_second.entry(second).or_insert(0) += sample.latency_ms;

        if !sample.ok && inner.errors.len() < MAX_ERROR_LOG {
            inner.errors.push(ErrorLogEntry {
                time_ms: sample.timestamp_ms,
                code: sample.http_status,
                message_prefix: String::new(),
            });
        }

        if inner.samples.len() < MAX_SAMPLE_LOG {
            inner.samples.push(sample);
        }
    }

    /// Same as `record`, but attaches an error/body preview message to the
    /// error-log entry (capped at 4096 bytes) when the sample is a failure.
    pub fn record_with_message(&self, sample: Sample, message: Option<&str>) {
        let is_error = !sample.ok;
        self.record(sample);
        if is_error {
            if let Some(message) = message {
                let mut inner = self.inner.lock().unwrap();
                if let Some(last) = inner.errors.last_mut() {
                    let truncated: String = message.chars().take(ERROR_MESSAGE_PREVIEW_BYTES).collect();
                    last.message_prefix = truncated;
                }
            }
        }
    }

    /// Reads the just-closed second's bucket, appends it to the derived
    /// time-series, and returns it for the tick event.
    pub fn tick(&self, second: u64) -> TimeSeriesPoint {
        let mut inner = self.inner.lock().unwrap();
        let count = *inner.count_by_second.get(&second).unwrap_or(&0);
        let latency_sum = *inner.latency_sum_by_second.get(&second).unwrap_or(&0);
        let avg_rt = if count > 0 {
            latency_sum as f64 / count as f64
        } else {
            0.0
        };
        let point = TimeSeriesPoint {
            second,
            rps: count,
            avg_rt,
        };
        inner.timeseries.push(point.clone());
        point
    }

    /// Current running totals, used for progress ticks.
    pub fn snapshot_totals(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.total, inner.passed, inner.failed)
    }

    /// Computes the final summary. `started_at_ms` is the test's start time
    /// in UNIX milliseconds (for `timestamp`/`duration` arithmetic).
    pub fn finalize(&self, started_at_ms: u64) -> Summary {
        let inner = self.inner.lock().unwrap();

        let now = now_ms();
        let duration_secs = ((now.saturating_sub(started_at_ms)) as f64 / 1000.0).max(0.001);

        let avg = if !inner.latencies.is_empty() {
            inner.latencies.iter().sum::<u64>() as f64 / inner.latencies.len() as f64
        } else {
            0.0
        };

        let p95 = percentile95(&inner.latencies);

        let achieved_tps = inner.total as f64 / duration_secs;
        let peak_rps = inner
            .timeseries
            .iter()
            .map(|p| p.rps as f64)
            .fold(0.0_f64, f64::max);
        let peak_rps = if peak_rps > 0.0 { peak_rps } else { achieved_tps };

        let success_rate = if inner.total > 0 {
            inner.passed as f64 / inner.total as f64 * 100.0
        } else {
            0.0
        };

        Summary {
            total_requests: inner.total,
            successful_requests: inner.passed,
            failed_requests: inner.failed,
            success_rate,
            avg_response_time: avg,
            percentile95: p95,
            peak_rps,
            requests_per_second: achieved_tps,
            duration: duration_secs,
            timestamp: chrono::Utc::now().to_rfc3339(),
            codes: inner.codes.clone(),
            errors: inner.errors.clone(),
            samples: inner.samples.clone(),
            timeseries: inner.timeseries.clone(),
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// `sorted_latencies[floor(0.95 * (n-1))]`, the exact p95 formula named in
/// the glossary. Returns 0.0 for an empty sample set.
fn percentile95(latencies: &[u64]) -> f64 {
    if latencies.is_empty() {
        return 0.0;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();
    let idx = ((sorted.len() - 1) as f64 * 0.95).floor() as usize;
    sorted[idx] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ok: bool, status: u16, latency_ms: u64, ts: u64) -> Sample {
        Sample {
            timestamp_ms: ts,
            http_status: status,
            latency_ms,
            ok,
        }
    }

    #[test]
    fn totals_add_up() {
        let agg = Aggregator::new();
        agg.record(sample(true, 200, 10, 1_000));
        agg.record(sample(false, 500, 20, 1_000));
        agg.record(sample(true, 200, 15, 2_000));

        let (total, passed, failed) = agg.snapshot_totals();
        assert_eq!(total, 3);
        assert_eq!(passed, 2);
        assert_eq!(failed, 1);
        assert_eq!(passed + failed, total);
    }

    #[test]
    fn percentile95_matches_exact_formula() {
        let latencies: Vec<u64> = (1..=100).collect();
        let idx = ((100 - 1) as f64 * 0.95).floor() as usize;
        assert_eq!(percentile95(&latencies), latencies[idx] as f64);
    }

    #[test]
    fn percentile95_empty_is_zero() {
        assert_eq!(percentile95(&[]), 0.0);
    }

    #[test]
    fn error_log_capped_at_200() {
        let agg = Aggregator::new();
        for i in 0..250 {
            agg.record(sample(false, 500, 1, 1_000 + i));
        }
        let summary = agg.finalize(1_000);
        assert_eq!(summary.errors.len(), 200);
        assert_eq!(summary.failed_requests, 250);
    }

    #[test]
    fn sample_log_capped_at_500() {
        let agg = Aggregator::new();
        for i in 0..600 {
            agg.record(sample(true, 200, 1, 1_000 + i));
        }
        let summary = agg.finalize(1_000);
        assert_eq!(summary.samples.len(), 500);
    }

    #[test]
    fn tick_reports_count_and_avg_for_closed_second() {
        let agg = Aggregator::new();
        agg.record(sample(true, 200, 10, 5_000));
        agg.record(sample(true, 200, 30, 5_500));

        let point = agg.tick(5);
        assert_eq!(point.rps, 2);
        assert_eq!(point.avg_rt, 20.0);
    }

    #[test]
    fn tick_on_empty_second_is_zero() {
        let agg = Aggregator::new();
        let point = agg.tick(42);
        assert_eq!(point.rps, 0);
        assert_eq!(point.avg_rt, 0.0);
    }

    #[test]
    fn success_rate_is_zero_when_no_requests() {
        let agg = Aggregator::new();
        let summary = agg.finalize(now_ms());
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.total_requests, 0);
    }

    #[test]
    fn finalize_sum_of_timeseries_rps_equals_total() {
        let agg = Aggregator::new();
        agg.record(sample(true, 200, 10, 1_000));
        agg.record(sample(true, 200, 10, 1_500));
        agg.record(sample(true, 200, 10, 2_000));
        agg.tick(1);
        agg.tick(2);

        let summary = agg.finalize(1_000);
        let ts_total: u64 = summary.timeseries.iter().map(|p| p.rps).sum();
        assert_eq!(ts_total, summary.total_requests);
    }
}
