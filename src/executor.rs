//! Request Executor (C2): issues one HTTP request, measures latency,
//! classifies the outcome, and produces a `Sample`. Never propagates an
//! error — every invocation yields exactly one `Sample`.
//!
//! Grounded on `worker.rs::build_request`/`run_worker`'s method dispatch and
//! body-draining loop, and on `original_source/backend/load_runner.py`'s
//! `_send_one` body-type handling.

use std::time::Instant;

use crate::aggregator::{now_ms, Sample};
use crate::config::{AuthConfig, BodyType, TestConfig};
use crate::errors::ErrorCategory;
use crate::memory_guard::is_percentile_tracking_active;
use crate::metrics::{REQUEST_DURATION_SECONDS, REQUEST_STATUS_CODES, REQUEST_TOTAL};
use crate::percentiles::GLOBAL_REQUEST_PERCENTILES;

const ERROR_MESSAGE_PREVIEW_BYTES: usize = 4096;

/// Result of one execution: the `Sample` recorded by C1, plus an optional
/// message (error text or response-body preview) for the error log.
pub struct ExecutionOutcome {
    pub sample: Sample,
    pub message: Option<String>,
}

/// Builds one request from `config` and issues it over `client`. `test_id`
/// labels the per-test Prometheus series; it plays no role in the Sample
/// the aggregator records.
pub async fn execute(
    client: &reqwest::Client,
    config: &TestConfig,
    test_id: &str,
) -> ExecutionOutcome {
    let request = build_request(client, config);
    let start = Instant::now();

    let result = request.send().await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let timestamp_ms = now_ms();

    REQUEST_TOTAL.inc();
    REQUEST_DURATION_SECONDS.observe(start.elapsed().as_secs_f64());
    if is_percentile_tracking_active() {
        GLOBAL_REQUEST_PERCENTILES.record_ms(latency_ms);
    }

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            let ok = (200..400).contains(&status);
            REQUEST_STATUS_CODES
                .with_label_values(&[test_id, &status.to_string()])
                .inc();

            let body_preview = drain_body(response).await;

            let message = if !ok { Some(body_preview) } else { None };

            ExecutionOutcome {
                sample: Sample {
                    timestamp_ms,
                    http_status: status,
                    latency_ms,
                    ok,
                },
                message,
            }
        }
        Err(err) => {
            let category = ErrorCategory::from_reqwest_error(&err);
            REQUEST_STATUS_CODES
                .with_label_values(&[test_id, "error"])
                .inc();
            ExecutionOutcome {
                sample: Sample {
                    timestamp_ms,
                    http_status: 0,
                    latency_ms,
                    ok: false,
                },
                message: Some(format!("[{}] {}", category.label(), err)),
            }
        }
    }
}

/// Drains the full response body in chunks (to avoid buffering an
/// unbounded body under sustained load) while keeping only the first 4096
/// bytes as a preview for the error log.
async fn drain_body(mut response: reqwest::Response) -> String {
    let mut preview = Vec::with_capacity(ERROR_MESSAGE_PREVIEW_BYTES.min(4096));
    while let Ok(Some(chunk)) = response.chunk().await {
        if preview.len() < ERROR_MESSAGE_PREVIEW_BYTES {
            let remaining = ERROR_MESSAGE_PREVIEW_BYTES - preview.len();
            preview.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        }
    }
    String::from_utf8_lossy(&preview).into_owned()
}

fn build_request(client: &reqwest::Client, config: &TestConfig) -> reqwest::RequestBuilder {
    let mut builder = client.request(config.method.as_reqwest(), &config.url);

    if !config.query.is_empty() {
        builder = builder.query(&config.query);
    }

    for (name, value) in &config.headers {
        builder = builder.header(name, value);
    }

    if let AuthConfig::Basic { username, password } = &config.auth {
        builder = builder.basic_auth(username, Some(password));
    }

    builder = match (&config.body, config.body_type) {
        (Some(body), BodyType::Json) => builder.json(body),
        (Some(serde_json::Value::Object(map)), BodyType::Form) => {
            let form: Vec<(String, String)> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_value_to_form_string(v)))
                .collect();
            builder.form(&form)
        }
        (Some(serde_json::Value::String(raw)), BodyType::Raw) => builder.body(raw.clone()),
        (Some(value), BodyType::Raw) => builder.body(value.to_string()),
        _ => builder,
    };

    builder
}

fn json_value_to_form_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpMethod;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base_config(url: String) -> TestConfig {
        TestConfig {
            url,
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

    #[tokio::test]
    async fn success_response_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = base_config(format!("{}/ok", server.uri()));

        let outcome = execute(&client, &config, "test_1").await;
        assert!(outcome.sample.ok);
        assert_eq!(outcome.sample.http_status, 200);
        assert!(outcome.message.is_none());
    }

    #[tokio::test]
    async fn server_error_is_not_ok_and_has_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaboom"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let config = base_config(format!("{}/boom", server.uri()));

        let outcome = execute(&client, &config, "test_1").await;
        assert!(!outcome.sample.ok);
        assert_eq!(outcome.sample.http_status, 500);
        assert_eq!(outcome.message.as_deref(), Some("kaboom"));
    }

    #[tokio::test]
    async fn transport_failure_yields_status_zero() {
        let client = reqwest::Client::new();
        let config = base_config("http://127.0.0.1:1".to_string());

        let outcome = execute(&client, &config, "test_1").await;
        assert!(!outcome.sample.ok);
        assert_eq!(outcome.sample.http_status, 0);
        assert!(outcome.message.is_some());
    }

    #[tokio::test]
    async fn json_body_posted_with_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let mut config = base_config(format!("{}/submit", server.uri()));
        config.method = HttpMethod::Post;
        config.body_type = BodyType::Json;
        config.body = Some(serde_json::json!({"key": "value"}));

        let outcome = execute(&client, &config, "test_1").await;
        assert!(outcome.sample.ok);
        assert_eq!(outcome.sample.http_status, 201);
    }
}
