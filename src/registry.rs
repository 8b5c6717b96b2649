//! Test Registry (C5): process-wide mapping from test id to runner state.
//!
//! Grounded on `percentiles.rs::MultiLabelPercentileTracker`'s `LruCache`
//! usage, repurposed here to bound the number of retained terminal test
//! records (SPEC_FULL.md §9(a)). `running`/`pending` records are never
//! evicted.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::aggregator::Summary;
use crate::config::TestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl TestStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Stopped | TestStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub config: TestConfig,
    pub status: TestStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub results: Option<Summary>,
    pub error: Option<String>,
}

struct Inner {
    records: LruCache<String, TestRecord>,
    next_id: AtomicU64,
}

/// Process-wide `id -> TestRecord` map behind one mutex. Ids are generated
/// from a monotonic counter (`test_<n>`), guaranteeing uniqueness per
/// process even for identical configs started in the same millisecond —
/// unlike the original's timestamp-seconds-based id, which could collide.
pub struct Registry {
    inner: Mutex<Inner>,
    max_tests: usize,
}

impl Registry {
    pub fn new(max_tests: usize) -> Self {
        let capacity = NonZeroUsize::new(max_tests.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                records: LruCache::new(capacity),
                next_id: AtomicU64::new(1),
            }),
            max_tests,
        }
    }

    /// Creates a new pending record and returns its id.
    pub fn create(&self, config: TestConfig) -> String {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("test_{}", n);

        let record = TestRecord {
            id: id.clone(),
            config,
            status: TestStatus::Pending,
            start_time: chrono::Utc::now().to_rfc3339(),
            end_time: None,
            results: None,
            error: None,
        };

        self.evict_terminal_if_needed(&mut inner.records);
        inner.records.put(id.clone(), record);
        id
    }

    fn evict_terminal_if_needed(&self, records: &mut LruCache<String, TestRecord>) {
        if records.len() < self.max_tests {
            return;
        }
        // Evict the least-recently-touched terminal record, if any. Scans
        // from the LRU end (`iter()` is most-recent-first in the `lru`
        // crate, so we walk in reverse for oldest-first).
        let victim = records
            .iter()
            .rev()
            .find(|(_, record)| record.status.is_terminal())
            .map(|(id, _)| id.clone());
        if let Some(id) = victim {
            records.pop(&id);
        }
    }

    pub fn get(&self, id: &str) -> Option<TestRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.get(id).cloned()
    }

    pub fn list(&self) -> Vec<TestRecord> {
        let inner = self.inner.lock().unwrap();
        inner.records.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Completed/stopped/failed records only, newest first — backs
    /// `GET /tests/history`.
    pub fn history(&self) -> Vec<TestRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .map(|(_, r)| r.clone())
            .filter(|r| r.status.is_terminal())
            .collect()
    }

    pub fn set_running(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(id) {
            record.status = TestStatus::Running;
        }
    }

    pub fn set_terminal(
        &self,
        id: &str,
        status: TestStatus,
        results: Option<Summary>,
        error: Option<String>,
    ) {
        debug_assert!(status.is_terminal());
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(id) {
            record.status = status;
            record.end_time = Some(chrono::Utc::now().to_rfc3339());
            record.results = results;
            record.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, BodyType, HttpMethod};
    use std::collections::HashMap;

    fn test_config() -> TestConfig {
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
            duration_seconds: Some(1),
            loop_count: None,
            ramp_up_seconds: 0,
            skip_tls_verify: false,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    #[test]
    fn identical_configs_get_different_ids() {
        let registry = Registry::new(50);
        let id1 = registry.create(test_config());
        let id2 = registry.create(test_config());
        assert_ne!(id1, id2);
    }

    #[test]
    fn get_returns_pending_record() {
        let registry = Registry::new(50);
        let id = registry.create(test_config());
        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, TestStatus::Pending);
    }

    #[test]
    fn set_running_then_terminal_transitions() {
        let registry = Registry::new(50);
        let id = registry.create(test_config());
        registry.set_running(&id);
        assert_eq!(registry.get(&id).unwrap().status, TestStatus::Running);

        registry.set_terminal(&id, TestStatus::Completed, None, None);
        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, TestStatus::Completed);
        assert!(record.end_time.is_some());
    }

    #[test]
    fn history_only_returns_terminal_records() {
        let registry = Registry::new(50);
        let running_id = registry.create(test_config());
        let done_id = registry.create(test_config());
        registry.set_running(&running_id);
        registry.set_terminal(&done_id, TestStatus::Completed, None, None);

        let history = registry.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, done_id);
    }

    #[test]
    fn running_tests_are_never_evicted() {
        let registry = Registry::new(2);
        let running_id = registry.create(test_config());
        registry.set_running(&running_id);

        // Fill past capacity with terminal records, which should be
        // evicted in preference to the running one.
        for _ in 0..5 {
            let id = registry.create(test_config());
            registry.set_terminal(&id, TestStatus::Completed, None, None);
        }

        assert!(registry.get(&running_id).is_some());
    }

    #[test]
    fn repeated_status_reads_are_stable() {
        let registry = Registry::new(50);
        let id = registry.create(test_config());
        registry.set_terminal(&id, TestStatus::Completed, None, None);

        let a = registry.get(&id).unwrap();
        let b = registry.get(&id).unwrap();
        assert_eq!(a.status, b.status);
        assert_eq!(a.end_time, b.end_time);
    }
}
