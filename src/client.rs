use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::fs::File;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{AuthConfig, TestConfig};
use crate::connection_pool::PoolConfig;

/// Builds the reqwest HTTP session a Load Runner (C4) owns for the lifetime
/// of one test. Basic auth attaches to the session; bearer auth becomes a
/// default header (unless the caller already set `Authorization`) — both
/// grounded on the original `HTTPLoadRunner._runner`'s session-level auth.
pub fn build_client(
    config: &TestConfig,
    request_timeout: Duration,
    pool_config: &PoolConfig,
) -> Result<reqwest::Client, Box<dyn std::error::Error + Send + Sync>> {
    let mut builder = reqwest::Client::builder().timeout(request_timeout);

    builder = configure_mtls(
        builder,
        config.client_cert_path.as_deref(),
        config.client_key_path.as_deref(),
    )?;

    let mut default_headers = configure_headers(&config.headers)?;

    if let AuthConfig::Bearer { token } = &config.auth {
        if !default_headers.contains_key(reqwest::header::AUTHORIZATION) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))?;
            default_headers.insert(reqwest::header::AUTHORIZATION, value);
        }
    }

    if !default_headers.is_empty() {
        builder = builder.default_headers(default_headers);
    }

    builder = pool_config.apply_to_builder(builder);

    if config.skip_tls_verify {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    if let AuthConfig::Basic { username, password } = &config.auth {
        // reqwest attaches Basic auth per-request, not per-session; the
        // Load Runner applies it on every request it builds via
        // `RequestBuilder::basic_auth`, so nothing further is needed here.
        let _ = (username, password);
    }

    Ok(builder.build()?)
}

fn configure_mtls(
    mut builder: reqwest::ClientBuilder,
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<reqwest::ClientBuilder, Box<dyn std::error::Error + Send + Sync>> {
    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut cert_pem_buf = Vec::new();
            File::open(cert_path)?.read_to_end(&mut cert_pem_buf)?;
            let mut key_pem_buf = Vec::new();
            File::open(key_path)?.read_to_end(&mut key_pem_buf)?;

            let mut cert_cursor = std::io::Cursor::new(cert_pem_buf.as_slice());
            let certs: Vec<_> = rustls_pemfile::certs(&mut cert_cursor).collect();
            if certs.is_empty() || certs.iter().any(|c| c.is_err()) {
                return Err(format!("no valid PEM certificates found in {}", cert_path).into());
            }

            let mut key_cursor = std::io::Cursor::new(key_pem_buf.as_slice());
            let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_cursor).collect();
            if keys.is_empty() || keys.iter().any(|k| k.is_err()) {
                return Err(format!(
                    "no valid PKCS#8 private key found in {} (must be PEM-encoded PKCS#8)",
                    key_path
                )
                .into());
            }

            let mut combined = Vec::new();
            combined.extend_from_slice(&cert_pem_buf);
            if !cert_pem_buf.ends_with(b"\n") {
                combined.push(b'\n');
            }
            combined.extend_from_slice(&key_pem_buf);

            let identity = reqwest::Identity::from_pem(&combined)?;
            builder = builder.identity(identity);
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err("client_cert_path and client_key_path must both be set, or neither".into());
        }
        (None, None) => {}
    }

    Ok(builder)
}

fn configure_headers(
    headers: &std::collections::HashMap<String, String>,
) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_str(name)
            .map_err(|e| format!("invalid header name '{}': {}", name, e))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid header value for '{}': {}", name, e))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BodyType, HttpMethod};
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
            duration_seconds: Some(1),
            loop_count: None,
            ramp_up_seconds: 0,
            skip_tls_verify: false,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    #[test]
    fn builds_client_with_no_special_config() {
        let pool = PoolConfig::default();
        let client = build_client(&base_config(), Duration::from_secs(5), &pool);
        assert!(client.is_ok());
    }

    #[test]
    fn bearer_token_becomes_default_header() {
        let mut config = base_config();
        config.auth = AuthConfig::Bearer {
            token: "abc123".to_string(),
        };
        let pool = PoolConfig::default();
        let client = build_client(&config, Duration::from_secs(5), &pool);
        assert!(client.is_ok());
    }

    #[test]
    fn rejects_cert_without_key() {
        let mut config = base_config();
        config.client_cert_path = Some("/tmp/does-not-exist.pem".to_string());
        let pool = PoolConfig::default();
        let client = build_client(&config, Duration::from_secs(5), &pool);
        assert!(client.is_err());
    }

    #[test]
    fn custom_headers_parse() {
        let mut headers = HashMap::new();
        headers.insert("X-Test".to_string(), "value".to_string());
        let parsed = configure_headers(&headers).unwrap();
        assert_eq!(parsed.get("x-test").unwrap(), "value");
    }
}
