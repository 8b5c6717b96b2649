use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("mTLS configuration incomplete: both client_cert_path and client_key_path must be set together, or neither")]
    IncompleteMtls,

    #[error("{field} is required: {message}")]
    MissingField { field: String, message: String },

    #[error("URL validation failed: {0}")]
    InvalidUrl(String),

    #[error("duration_seconds and loop_count may not both be set")]
    DurationAndLoopCountBothSet,

    #[error("exactly one of duration_seconds or loop_count must be set")]
    NoRunLimitSet,

    #[error("{0}")]
    Invalid(String),
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to parse a boolean environment variable.
fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

/// Process-wide ambient configuration, loaded once at startup from the
/// environment. Distinct from `TestConfig`, which arrives per-request as a
/// JSON body.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub metrics_port: u16,
    pub drain_grace: Duration,
    pub request_timeout: Duration,
    pub registry_max_tests: usize,
    pub telemetry_outbox_capacity: usize,
    pub results_dir: Option<String>,
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let metrics_port: u16 = env_parse_or("METRICS_PORT", 9090)?;
        let drain_grace_secs: u64 = env_parse_or("DRAIN_GRACE_SECONDS", 30)?;
        let request_timeout_secs: u64 = env_parse_or("REQUEST_TIMEOUT_SECONDS", 30)?;
        let registry_max_tests: usize = env_parse_or("REGISTRY_MAX_TESTS", 500)?;
        let telemetry_outbox_capacity: usize = env_parse_or("TELEMETRY_OUTBOX_CAPACITY", 256)?;
        let results_dir = if env_bool("PERSIST_RESULTS", true) {
            Some(env::var("RESULTS_DIR").unwrap_or_else(|_| "results".to_string()))
        } else {
            None
        };

        let config = ServerConfig {
            bind_addr,
            metrics_port,
            drain_grace: Duration::from_secs(drain_grace_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            registry_max_tests,
            telemetry_outbox_capacity,
            results_dir,
        };

        Ok(config)
    }

    /// A configuration suitable for unit/integration tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            metrics_port: 0,
            drain_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            registry_max_tests: 50,
            telemetry_outbox_capacity: 32,
            results_dir: None,
        }
    }
}

/// HTTP method allowed on a load-test target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// How `body` should be interpreted and serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Raw,
    Form,
    Json,
}

/// Authentication to attach to the request session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// The request shape and load parameters a load test is run with.
///
/// Immutable once validated; the control API never mutates a `TestConfig`
/// after acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default = "default_auth")]
    pub auth: AuthConfig,
    pub max_concurrency: u32,
    #[serde(default)]
    pub target_tps: f64,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub loop_count: Option<u64>,
    #[serde(default)]
    pub ramp_up_seconds: u64,

    // ambient HTTP-session knobs, optional on every request
    #[serde(default)]
    pub skip_tls_verify: bool,
    #[serde(default)]
    pub client_cert_path: Option<String>,
    #[serde(default)]
    pub client_key_path: Option<String>,
}

fn default_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_auth() -> AuthConfig {
    AuthConfig::None
}

const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

impl TestConfig {
    /// Validates the config before it is accepted by the control API.
    /// Mirrors the teacher's `Config::validate` shape: one check per rule,
    /// first failure wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        if self.target_tps < 0.0 {
            return Err(ConfigError::Invalid(
                "target_tps must be non-negative".to_string(),
            ));
        }

        match (self.duration_seconds, self.loop_count) {
            (Some(_), Some(_)) => return Err(ConfigError::DurationAndLoopCountBothSet),
            (None, None) => return Err(ConfigError::NoRunLimitSet),
            (Some(0), _) | (_, Some(0)) => {
                return Err(ConfigError::Invalid(
                    "duration_seconds/loop_count must be positive".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(duration) = self.duration_seconds {
            if self.ramp_up_seconds > duration {
                return Err(ConfigError::Invalid(
                    "ramp_up_seconds must not exceed duration_seconds".to_string(),
                ));
            }
        }

        let parsed =
            reqwest::Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}': only http/https are allowed",
                parsed.scheme()
            )));
        }

        if self.body_type == BodyType::Form {
            match &self.body {
                Some(serde_json::Value::Object(_)) | None => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(
                        "body_type=form requires a JSON object body".to_string(),
                    ))
                }
            }
        }

        if let AuthConfig::Basic { username, password } = &self.auth {
            if username.is_empty() || password.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "auth".to_string(),
                    message: "basic auth requires both username and password".to_string(),
                });
            }
        }

        if let (Some(cert), None) | (None, Some(cert)) =
            (&self.client_cert_path, &self.client_key_path)
        {
            let _ = cert;
            return Err(ConfigError::IncompleteMtls);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TestConfig {
        TestConfig {
            url: "http://example.com/ok".to_string(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            body_type: BodyType::Raw,
            auth: AuthConfig::None,
            max_concurrency: 10,
            target_tps: 50.0,
            duration_seconds: Some(10),
            loop_count: None,
            ramp_up_seconds: 0,
            skip_tls_verify: false,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut c = base_config();
        c.max_concurrency = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duration_and_loop_count_together() {
        let mut c = base_config();
        c.loop_count = Some(5);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::DurationAndLoopCountBothSet)
        ));
    }

    #[test]
    fn rejects_neither_duration_nor_loop_count() {
        let mut c = base_config();
        c.duration_seconds = None;
        assert!(matches!(c.validate(), Err(ConfigError::NoRunLimitSet)));
    }

    #[test]
    fn rejects_ramp_up_exceeding_duration() {
        let mut c = base_config();
        c.ramp_up_seconds = 20;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let mut c = base_config();
        c.url = "ftp://example.com".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_incomplete_basic_auth() {
        let mut c = base_config();
        c.auth = AuthConfig::Basic {
            username: "".to_string(),
            password: "secret".to_string(),
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_mtls_paths() {
        let mut c = base_config();
        c.client_cert_path = Some("/tmp/cert.pem".to_string());
        assert!(matches!(c.validate(), Err(ConfigError::IncompleteMtls)));
    }

    #[test]
    fn server_config_for_testing_has_short_timeouts() {
        let c = ServerConfig::for_testing();
        assert_eq!(c.drain_grace, Duration::from_secs(5));
        assert_eq!(c.registry_max_tests, 50);
    }
}
