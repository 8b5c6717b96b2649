//! Load Runner (C4): owns one test's end-to-end lifecycle, from building its
//! HTTP session through publishing the terminal telemetry event.
//!
//! Grounded on `worker.rs::run_worker`'s per-test task shape (own client,
//! own aggregator, own ticker) and `original_source/backend/load_runner.py`'s
//! `HTTPLoadRunner.run`, which drives the same build-session -> pace ->
//! finalize -> persist sequence from a single coroutine.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::aggregator::Aggregator;
use crate::config::{ServerConfig, TestConfig};
use crate::connection_pool::{PoolConfig, PoolStatsTracker};
use crate::metrics::{RUNNING_TESTS, TESTS_TOTAL};
use crate::registry::{Registry, TestStatus};
use crate::results;
use crate::scheduler::{self, CancelToken};
use crate::telemetry::{TelemetryBus, TelemetryEvent};

/// Starts a test's runner task and returns a token the control API can use
/// to request early termination (`POST /test/{id}/stop`).
pub fn spawn(
    id: String,
    config: TestConfig,
    server_config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    telemetry: Arc<TelemetryBus>,
) -> CancelToken {
    let cancel = CancelToken::new();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        drive(id, config, server_config, registry, telemetry, task_cancel).await;
    });

    cancel
}

async fn drive(
    id: String,
    config: TestConfig,
    server_config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    telemetry: Arc<TelemetryBus>,
    cancel: CancelToken,
) {
    let config = Arc::new(config);

    let client = match crate::client::build_client(
        &config,
        server_config.request_timeout,
        &PoolConfig::default(),
    ) {
        Ok(client) => client,
        Err(err) => {
            fail(&id, &registry, &telemetry, err.to_string());
            return;
        }
    };

    registry.set_running(&id);
    RUNNING_TESTS.inc();

    let aggregator = Arc::new(Aggregator::new());
    let started_at_ms = crate::aggregator::now_ms();

    let ticker = tokio::spawn(run_ticker(
        id.clone(),
        Arc::clone(&config),
        Arc::clone(&aggregator),
        Arc::clone(&telemetry),
        started_at_ms,
        cancel.clone(),
    ));

    // A test's own duration/loop_count bounds the scheduler already; the
    // drain grace is an outer safety net against a scheduler that hangs
    // (e.g. a stuck in-flight request outliving its client timeout).
    let hard_deadline = config
        .duration_seconds
        .map(|secs| Duration::from_secs(secs) + server_config.drain_grace);

    let test_id: Arc<str> = Arc::from(id.as_str());
    let pool_stats = Arc::new(PoolStatsTracker::default());
    let run_future = scheduler::run(
        client,
        Arc::clone(&config),
        Arc::clone(&aggregator),
        cancel.clone(),
        test_id,
        Arc::clone(&pool_stats),
    );
    match hard_deadline {
        Some(deadline) => {
            if tokio::time::timeout(deadline, run_future).await.is_err() {
                cancel.cancel();
                error!(test_id = %id, "test exceeded its hard deadline, forcing stop");
            }
        }
        None => run_future.await,
    }

    cancel.cancel();
    ticker.abort();

    RUNNING_TESTS.dec();
    info!(test_id = %id, pool_stats = %pool_stats.stats().format(), "connection pool behavior for finished test");

    let summary = aggregator.finalize(started_at_ms);
    let status = if cancel.is_user_stop() {
        TestStatus::Stopped
    } else {
        TestStatus::Completed
    };

    registry.set_terminal(&id, status, Some(summary.clone()), None);
    TESTS_TOTAL
        .with_label_values(&[status_label(status)])
        .inc();

    let event = match status {
        TestStatus::Stopped => TelemetryEvent::TestStopped {
            test_id: id.clone(),
            summary: summary.clone(),
        },
        _ => TelemetryEvent::TestCompleted {
            test_id: id.clone(),
            summary: summary.clone(),
        },
    };
    telemetry.publish(&id, event);
    telemetry.retire(&id);

    if let Some(results_dir) = &server_config.results_dir {
        results::persist(results_dir, &id, &summary).await;
    }

    info!(test_id = %id, status = status_label(status), "test finished");
}

/// `progress = min(elapsed/duration*100, 100)` in duration mode; in
/// iteration mode (no `duration_seconds`) the best available stand-in is
/// completed-over-target, since there is no wall-clock target to divide by.
fn progress_percent(config: &TestConfig, elapsed: f64, total_requests: u64) -> f64 {
    match (config.duration_seconds, config.loop_count) {
        (Some(duration), _) if duration > 0 => (elapsed / duration as f64 * 100.0).min(100.0),
        (_, Some(loop_count)) if loop_count > 0 => {
            (total_requests as f64 / loop_count as f64 * 100.0).min(100.0)
        }
        _ => 0.0,
    }
}

fn status_label(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Completed => "completed",
        TestStatus::Stopped => "stopped",
        TestStatus::Failed => "failed",
        TestStatus::Running | TestStatus::Pending => "running",
    }
}

fn fail(id: &str, registry: &Registry, telemetry: &TelemetryBus, error: String) {
    registry.set_terminal(id, TestStatus::Failed, None, Some(error.clone()));
    TESTS_TOTAL.with_label_values(&["failed"]).inc();
    telemetry.publish(
        id,
        TelemetryEvent::TestFailed {
            test_id: id.to_string(),
            error,
        },
    );
    telemetry.retire(id);
}

/// Emits a `test_update` telemetry event once per second until `cancel` is
/// set, mirroring `worker.rs`'s progress-reporting cadence.
///
/// The just-closed second is the current absolute UNIX second minus one,
/// matching the bucket key `Aggregator::record` assigns from a sample's own
/// `timestamp_ms / 1000` (`original_source/backend/load_runner.py:151`'s
/// `now_sec = int(time.time())` against the same `int(ts_ms // 1000)` key).
async fn run_ticker(
    id: String,
    config: Arc<TestConfig>,
    aggregator: Arc<Aggregator>,
    telemetry: Arc<TelemetryBus>,
    started_at_ms: u64,
    cancel: CancelToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if cancel.is_cancelled() {
            break;
        }

        let now_ms = crate::aggregator::now_ms();
        let closed_second = now_ms / 1000 - 1;
        let point = aggregator.tick(closed_second);
        let (total, passed, failed) = aggregator.snapshot_totals();

        let elapsed = (now_ms.saturating_sub(started_at_ms)) as f64 / 1000.0;
        let progress = progress_percent(&config, elapsed, total);

        telemetry.publish(
            &id,
            TelemetryEvent::TestUpdate {
                test_id: id.clone(),
                elapsed,
                progress,
                total_requests: total,
                successful_requests: passed,
                failed_requests: failed,
                point,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, BodyType, HttpMethod};
    use std::collections::HashMap;

    fn base_config() -> TestConfig {
        TestConfig {
            url: "http://example.com".to_string(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            body_type: BodyType::Raw,
            auth: AuthConfig::None,
            max_concurrency: 1,
            target_tps: 0.0,
            duration_seconds: Some(10),
            loop_count: None,
            ramp_up_seconds: 0,
            skip_tls_verify: false,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    #[test]
    fn progress_in_duration_mode_is_elapsed_over_duration() {
        let config = base_config();
        assert_eq!(progress_percent(&config, 5.0, 0), 50.0);
    }

    #[test]
    fn progress_in_duration_mode_caps_at_100() {
        let config = base_config();
        assert_eq!(progress_percent(&config, 50.0, 0), 100.0);
    }

    #[test]
    fn progress_in_iteration_mode_uses_completed_over_loop_count() {
        let mut config = base_config();
        config.duration_seconds = None;
        config.loop_count = Some(200);
        assert_eq!(progress_percent(&config, 999.0, 50), 25.0);
    }

    /// The just-closed-second arithmetic the ticker uses must key into the
    /// same absolute-UNIX-second space `Aggregator::record` buckets samples
    /// into (`sample.timestamp_ms / 1000`), not a relative per-tick counter.
    #[test]
    fn closed_second_tracks_absolute_unix_time_not_a_relative_counter() {
        let now_ms = crate::aggregator::now_ms();
        let closed_second = now_ms / 1000 - 1;

        assert!(closed_second > 1_000_000_000);
        assert_eq!(closed_second, now_ms / 1000 - 1);
    }
}
