use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::transport::{Reply, Request, Transport, TransportFactory};
use crate::utils::parse_headers_with_escapes;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,

    /// How long idle connections stay in the pool before cleanup
    pub idle_timeout: Duration,

    /// TCP keepalive duration
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl PoolConfig {
    /// Apply this configuration to a reqwest ClientBuilder.
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder
    }
}

/// Configuration for building the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub skip_tls_verify: bool,
    pub custom_headers: Option<String>,
    pub pool_config: PoolConfig,
    /// Give every virtual user its own cookie jar.
    pub cookie_store: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            skip_tls_verify: false,
            custom_headers: None,
            pool_config: PoolConfig::default(),
            cookie_store: true,
        }
    }
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(
    config: &ClientConfig,
    parsed_headers: &HeaderMap,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut client_builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .cookie_store(config.cookie_store);

    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
    }

    client_builder = config.pool_config.apply_to_builder(client_builder);

    if config.skip_tls_verify {
        client_builder = client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    client_builder.build()
}

/// Parses `CUSTOM_HEADERS`-style strings ("Name:Value,Other:Value").
pub fn configure_custom_headers(custom_headers_str: Option<&str>) -> Result<HeaderMap, String> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair_str in parse_headers_with_escapes(headers_str) {
        let header_pair_str_trimmed = header_pair_str.trim();
        if header_pair_str_trimmed.is_empty() {
            continue;
        }

        let (name_str, value_str) = header_pair_str_trimmed.split_once(':').ok_or_else(|| {
            format!(
                "Invalid header format in CUSTOM_HEADERS: '{}'. Expected 'Name:Value'.",
                header_pair_str_trimmed
            )
        })?;
        let name_str = name_str.trim();
        let value_str = value_str.trim();

        if name_str.is_empty() {
            return Err(format!(
                "Invalid header format: Header name cannot be empty in '{}'.",
                header_pair_str_trimmed
            ));
        }

        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| format!("Invalid header name: {}. Name: '{}'", e, name_str))?;
        let header_value = HeaderValue::from_str(value_str).map_err(|e| {
            format!(
                "Invalid header value for '{}': {}. Value: '{}'",
                name_str, e, value_str
            )
        })?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}

/// [`Transport`] backed by a reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &Request) -> Result<Reply, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(TransportError::from_reqwest)?;
        let latency = start.elapsed();

        debug!(
            method = %request.method,
            url = %request.url,
            status_code = status,
            latency_ms = latency.as_millis() as u64,
            "Request completed"
        );

        Ok(Reply {
            status,
            body,
            headers,
            latency,
        })
    }
}

/// Builds one reqwest client per virtual user so cookies and sessions do not
/// leak between users.
pub struct ReqwestTransportFactory {
    config: ClientConfig,
    parsed_headers: HeaderMap,
    shared: ReqwestTransport,
}

impl ReqwestTransportFactory {
    pub fn new(config: ClientConfig) -> Result<Self, String> {
        let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
        let shared = ReqwestTransport::new(
            build_client(&config, &parsed_headers).map_err(|e| e.to_string())?,
        );

        info!(
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            skip_tls_verify = config.skip_tls_verify,
            custom_headers = parsed_headers.len(),
            cookie_store = config.cookie_store,
            max_idle_per_host = config.pool_config.max_idle_per_host,
            "HTTP client configured"
        );
        if config.skip_tls_verify {
            warn!("Skipping TLS certificate verification");
        }

        Ok(Self {
            config,
            parsed_headers,
            shared,
        })
    }

    pub fn parsed_headers(&self) -> &HeaderMap {
        &self.parsed_headers
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self, user_id: usize) -> Result<Arc<dyn Transport>, TransportError> {
        if !self.config.cookie_store {
            return Ok(Arc::new(self.shared.clone()));
        }
        let client = build_client(&self.config, &self.parsed_headers)
            .map_err(TransportError::from_reqwest)?;
        debug!(user_id, "Created per-user HTTP client");
        Ok(Arc::new(ReqwestTransport::new(client)))
    }
}
