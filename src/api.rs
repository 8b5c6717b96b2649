//! Control API (C7): the HTTP + WebSocket surface load tests are driven
//! through.
//!
//! Grounded on `worker.rs`'s single-route `hyper` server for the overall
//! shape of a thin handler delegating straight into the runner/registry,
//! generalized here to axum's router since this spec needs several JSON
//! routes plus a WebSocket upgrade the teacher's raw-hyper pattern doesn't
//! support in one server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{ServerConfig, TestConfig};
use crate::errors::ApiError;
use crate::registry::{Registry, TestRecord, TestStatus};
use crate::runner;
use crate::scheduler::CancelToken;
use crate::telemetry::TelemetryBus;

/// Shared state every handler closes over.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub telemetry: Arc<TelemetryBus>,
    pub server_config: Arc<ServerConfig>,
    /// Live cancel tokens for running tests, keyed by id. Entries are
    /// removed once the runner task observes completion; a stop request
    /// for an id no longer present here means the test already finished.
    pub cancel_tokens: Mutex<HashMap<String, CancelToken>>,
}

impl AppState {
    pub fn new(server_config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry::new(server_config.registry_max_tests)),
            telemetry: Arc::new(TelemetryBus::new(server_config.telemetry_outbox_capacity)),
            server_config: Arc::new(server_config),
            cancel_tokens: Mutex::new(HashMap::new()),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/test/start", post(start_test))
        .route("/test/:id/status", get(test_status))
        .route("/test/:id/stop", post(stop_test))
        .route("/tests", get(list_tests))
        .route("/tests/history", get(test_history))
        .route("/ws", get(ws_upgrade))
        .route("/metrics/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn start_test(
    State(state): State<Arc<AppState>>,
    Json(config): Json<TestConfig>,
) -> Result<impl IntoResponse, ApiError> {
    config.validate()?;

    let normalised_config = config.clone();
    let id = state.registry.create(config.clone());
    let cancel = runner::spawn(
        id.clone(),
        config,
        Arc::clone(&state.server_config),
        Arc::clone(&state.registry),
        Arc::clone(&state.telemetry),
    );
    state.cancel_tokens.lock().unwrap().insert(id.clone(), cancel);

    info!(test_id = %id, "test started");
    Ok(Json(serde_json::json!({
        "success": true,
        "testId": id,
        "status": "accepted",
        "config": normalised_config,
    })))
}

async fn test_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;
    Ok(Json(record))
}

async fn stop_test(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    if record.status != TestStatus::Running {
        return Err(ApiError::NotRunning(id));
    }

    let tokens = state.cancel_tokens.lock().unwrap();
    match tokens.get(&id) {
        Some(cancel) => {
            cancel.cancel_as_user_stop();
            Ok(Json(serde_json::json!({"success": true})))
        }
        None => Err(ApiError::NotRunning(id)),
    }
}

async fn list_tests(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn test_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let flattened: Vec<serde_json::Value> = state
        .registry
        .history()
        .into_iter()
        .map(flatten_summary_fields)
        .collect();
    Json(flattened)
}

/// Flattens a terminal `TestRecord`'s nested `results` summary into the
/// top-level JSON object, per spec.md §6's "completed tests with flattened
/// summary fields" contract for `GET /tests/history`.
fn flatten_summary_fields(record: TestRecord) -> serde_json::Value {
    let results = record.results.clone();
    let mut value = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);

    if let serde_json::Value::Object(map) = &mut value {
        map.remove("results");
        if let Some(summary) = results {
            if let Ok(serde_json::Value::Object(summary_map)) = serde_json::to_value(&summary) {
                map.extend(summary_map);
            }
        }
    }

    value
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    JoinTestMonitor {
        #[serde(rename = "testId")]
        test_id: String,
    },
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Services one WebSocket connection. Subscribers receive every test's
/// events by default; sending `{"type":"join_test_monitor","testId":"..."}`
/// narrows the feed to that one test id's channel.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.telemetry.subscribe(None);

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::JoinTestMonitor { test_id }) => {
                                subscription = state.telemetry.subscribe(Some(&test_id));
                            }
                            Err(err) => {
                                warn!(error = %err, "malformed websocket subscription message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app() -> Router {
        router(AppState::new(ServerConfig::for_testing()))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn terminal_record(results: Option<crate::aggregator::Summary>) -> TestRecord {
        TestRecord {
            id: "test_1".to_string(),
            config: serde_json::from_value(serde_json::json!({
                "url": "http://example.com",
                "max_concurrency": 1,
                "loop_count": 1
            }))
            .unwrap(),
            status: TestStatus::Completed,
            start_time: "2024-01-01T00:00:00Z".to_string(),
            end_time: Some("2024-01-01T00:00:01Z".to_string()),
            results,
            error: None,
        }
    }

    #[test]
    fn flatten_summary_fields_lifts_results_to_top_level() {
        let summary = crate::aggregator::Aggregator::new().finalize(0);
        let flattened = flatten_summary_fields(terminal_record(Some(summary)));

        assert_eq!(flattened["id"], serde_json::json!("test_1"));
        assert!(flattened.get("results").is_none());
        assert!(flattened.get("totalRequests").is_some());
        assert!(flattened.get("successRate").is_some());
    }

    #[test]
    fn flatten_summary_fields_handles_missing_results() {
        let flattened = flatten_summary_fields(terminal_record(None));
        assert_eq!(flattened["id"], serde_json::json!("test_1"));
        assert!(flattened.get("results").is_none());
        assert!(flattened.get("totalRequests").is_none());
    }

    fn valid_config_body(url: String) -> serde_json::Value {
        serde_json::json!({
            "url": url,
            "method": "GET",
            "max_concurrency": 2,
            "target_tps": 0,
            "loop_count": 1
        })
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test/start")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"url": "http://x", "max_concurrency": 0}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_for_unknown_id_is_not_found() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/test/does-not-exist/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_unknown_id_is_not_found() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test/does-not-exist/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_tests_starts_empty() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/tests")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn start_then_poll_status_reaches_completed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let app = app();

        let start_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test/start")
                    .header("content-type", "application/json")
                    .body(Body::from(valid_config_body(server.uri()).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(start_response.status(), StatusCode::OK);
        let start_body = body_json(start_response).await;
        assert_eq!(start_body["success"], serde_json::json!(true));
        assert_eq!(start_body["status"], serde_json::json!("accepted"));
        assert!(start_body["config"].is_object());
        let id = start_body["testId"].as_str().unwrap().to_string();

        let mut final_status = String::new();
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/test/{id}/status"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            final_status = body["status"].as_str().unwrap().to_string();
            if final_status == "completed" {
                assert_eq!(body["results"]["totalRequests"], serde_json::json!(1));
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(final_status, "completed");

        let history_response = app
            .oneshot(
                Request::builder()
                    .uri("/tests/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let history = body_json(history_response).await;
        let entry = history
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["id"] == id)
            .unwrap();
        assert_eq!(entry["totalRequests"], serde_json::json!(1));
        assert!(entry.get("results").is_none());
    }

    #[tokio::test]
    async fn stop_a_non_running_test_is_rejected() {
        let app = app();
        let start_response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test/start")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        valid_config_body("http://127.0.0.1:1".to_string()).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(start_response).await;
        let id = body["testId"].as_str().unwrap().to_string();

        // Wait for the one-shot (loop_count=1) test to reach a terminal state.
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/test/{id}/status"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let status_body = body_json(response).await;
            if status_body["status"] != "running" && status_body["status"] != "pending" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let stop_response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/test/{id}/stop"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stop_response.status(), StatusCode::CONFLICT);
    }
}
