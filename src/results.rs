//! Best-effort on-disk persistence of final test summaries to
//! `<results_dir>/<id>.json`. Grounded on `original_source/backend/storage.py`'s
//! one-file-per-run layout. A write failure is logged, never propagated —
//! the in-memory registry record remains the authoritative copy per
//! SPEC_FULL.md §6.

use tracing::warn;

use crate::aggregator::Summary;

/// Writes `summary` to `<results_dir>/<id>.json`, creating the directory if
/// needed. Failures are swallowed after being logged.
pub async fn persist(results_dir: &str, id: &str, summary: &Summary) {
    if let Err(err) = persist_inner(results_dir, id, summary).await {
        warn!(test_id = id, error = %err, "failed to persist test results");
    }
}

async fn persist_inner(
    results_dir: &str,
    id: &str,
    summary: &Summary,
) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(results_dir).await?;
    let path = std::path::Path::new(results_dir).join(format!("{}.json", id));
    let body = serde_json::to_vec_pretty(summary)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(path, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_summary() -> Summary {
        Summary {
            total_requests: 1,
            successful_requests: 1,
            failed_requests: 0,
            success_rate: 100.0,
            avg_response_time: 12.0,
            percentile95: 12.0,
            peak_rps: 1.0,
            requests_per_second: 1.0,
            duration: 1.0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            codes: HashMap::new(),
            errors: Vec::new(),
            samples: Vec::new(),
            timeseries: Vec::new(),
        }
    }

    #[tokio::test]
    async fn persists_summary_to_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap();

        persist(dir_path, "test_1", &sample_summary()).await;

        let written = tokio::fs::read_to_string(dir.path().join("test_1.json"))
            .await
            .unwrap();
        assert!(written.contains("\"totalRequests\""));
    }

    #[tokio::test]
    async fn write_failure_does_not_panic() {
        // A path with an embedded NUL cannot be created as a directory;
        // `persist` must swallow the error instead of propagating a panic.
        persist("/dev/null/not-a-directory", "test_1", &sample_summary()).await;
    }
}
