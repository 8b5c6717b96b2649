//! Pacing Scheduler (C3): decides when to launch requests so the achieved
//! rate tracks the target without admitting unbounded in-flight work.
//!
//! Grounded on `worker.rs::run_worker`'s `next_fire`/`sleep_until` leaky
//! bucket (kept verbatim: `next_slot += interval`, no catch-up clamp) and
//! `load_models.rs::LoadModel::calculate_ramp_rps`'s linear ramp math,
//! reduced to this spec's single ramp-then-steady shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::Semaphore;
use tokio::time::{self, Duration, Instant};

use crate::aggregator::Aggregator;
use crate::config::TestConfig;
use crate::connection_pool::PoolStatsTracker;
use crate::executor;
use crate::metrics::CONCURRENT_REQUESTS;

/// What ends the scheduler's loop.
enum RunLimit {
    Duration(StdDuration),
    Iterations(u64),
}

/// Shared flag a runner sets to request early termination (`stop_test`).
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    user_requested: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancels and records that the stop came from `POST /test/{id}/stop`
    /// rather than the runner's own hard deadline, so the terminal status
    /// can be `stopped` instead of `completed`/`failed`.
    pub fn cancel_as_user_stop(&self) {
        self.user_requested.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_user_stop(&self) -> bool {
        self.user_requested.load(Ordering::Relaxed)
    }
}

/// Computes the effective target TPS at elapsed time `e`, applying the
/// linear ramp-up when `e < ramp_up`.
fn current_tps(target_tps: f64, ramp_up: StdDuration, elapsed: StdDuration) -> f64 {
    if ramp_up.is_zero() || elapsed >= ramp_up {
        return target_tps;
    }
    target_tps * (elapsed.as_secs_f64() / ramp_up.as_secs_f64())
}

/// Drives the paced request loop for one test until its run limit is
/// reached or `cancel` is set. Every launched request's sample (and
/// optional error message) is recorded into `aggregator`.
pub async fn run(
    client: reqwest::Client,
    config: Arc<TestConfig>,
    aggregator: Arc<Aggregator>,
    cancel: CancelToken,
    test_id: Arc<str>,
    pool_stats: Arc<PoolStatsTracker>,
) {
    let limit = match (config.duration_seconds, config.loop_count) {
        (Some(secs), None) => RunLimit::Duration(StdDuration::from_secs(secs)),
        (None, Some(n)) => RunLimit::Iterations(n),
        // Unreachable once `TestConfig::validate` has run, but the scheduler
        // must still terminate rather than loop forever.
        _ => RunLimit::Iterations(1),
    };

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency as usize));
    let ramp_up = StdDuration::from_secs(config.ramp_up_seconds);

    let started_at = Instant::now();
    let mut next_slot = started_at;
    let mut launched: u64 = 0;
    let mut in_flight = Vec::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match &limit {
            RunLimit::Duration(d) => {
                if started_at.elapsed() >= *d {
                    break;
                }
            }
            RunLimit::Iterations(n) => {
                if launched >= *n {
                    break;
                }
            }
        }

        let elapsed = started_at.elapsed();
        let tps = current_tps(config.target_tps, ramp_up, elapsed);

        if cancel.is_cancelled() {
            break;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let client = client.clone();
        let config = Arc::clone(&config);
        let aggregator = Arc::clone(&aggregator);
        let test_id = Arc::clone(&test_id);
        let pool_stats = Arc::clone(&pool_stats);

        CONCURRENT_REQUESTS.with_label_values(&[&test_id]).inc();
        let handle = tokio::spawn(async move {
            let outcome = executor::execute(&client, &config, &test_id).await;
            pool_stats.record_request(outcome.sample.latency_ms);
            aggregator.record_with_message(outcome.sample, outcome.message.as_deref());
            CONCURRENT_REQUESTS.with_label_values(&[&test_id]).dec();
            drop(permit);
        });
        in_flight.push(handle);
        launched += 1;

        if tps > 0.0 && tps.is_finite() {
            let interval = Duration::from_secs_f64(1.0 / tps);
            next_slot += interval;
            if cancel.is_cancelled() {
                break;
            }
            time::sleep_until(next_slot).await;
        }
        // tps <= 0 (unpaced mode): the semaphore alone gates admission, no sleep.
    }

    // Drain in-flight requests; their own HTTP client timeout bounds this.
    for handle in in_flight {
        let _ = handle.await;
    }
}
