//! The request primitive consumed by virtual users.
//!
//! The engine never talks to an HTTP library directly. Every request goes
//! through a [`Transport`], one instance per virtual user (so cookie jars and
//! sessions stay isolated), created by a [`TransportFactory`].

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::TransportError;

/// A fully rendered outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
    /// Extra headers for this request, e.g. `Content-Type` for JSON bodies.
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response as seen by the engine.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub headers: HeaderMap,
    /// Time from sending the request until the body was fully read.
    pub latency: Duration,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<String>, latency: Duration) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HeaderMap::new(),
            latency,
        }
    }
}

/// Sends one request and reports the response or a transport failure.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Reply, TransportError>;
}

/// Creates the transport for a newly spawned virtual user.
pub trait TransportFactory: Send + Sync {
    fn create(&self, user_id: usize) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Factory that hands every user the same transport.
///
/// Useful when the transport holds no per-user state, and in tests.
pub struct SharedTransport(pub Arc<dyn Transport>);

impl TransportFactory for SharedTransport {
    fn create(&self, _user_id: usize) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(self.0.clone())
    }
}
