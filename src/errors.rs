//! Error types and failure categorization.
//!
//! Two families live here. [`ConfigError`] covers everything that is fatal at
//! setup time and must surface before the first virtual user is spawned.
//! [`ErrorCategory`] and [`TransportError`] classify per-request failures,
//! which are never fatal: they are folded into failed outcomes and counted.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Configuration errors detected while building a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No eligible actions for '{0}': the candidate set is empty")]
    NoEligibleActions(String),

    #[error("Total weight of eligible actions for '{0}' is zero")]
    ZeroTotalWeight(String),

    #[error("Action '{0}' has weight 0; weights must be positive")]
    ZeroWeight(String),

    #[error("Journey '{0}' has no steps")]
    EmptyJourney(String),

    #[error("Test plan defines no user types")]
    NoUserTypes,

    #[error("Unknown user type '{0}'")]
    UnknownUserType(String),

    #[error("Invalid run configuration: {0}")]
    InvalidRunConfig(String),

    #[error("Invalid template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("Invalid {var}: {message}")]
    InvalidEnv { var: String, message: String },

    #[error("{var} environment variable must be set")]
    MissingEnv { var: String },
}

/// Categories of errors that can occur during load testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// TLS/SSL certificate errors
    TlsError,

    /// A successful response whose body did not yield a required value
    ExtractionError,

    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for 2xx/3xx; callers that whitelist other statuses
    /// decide success themselves and only use this for labelling failures.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() {
            ErrorCategory::NetworkError
        } else if error.is_body() || error.is_decode() {
            // Response body errors - usually network or server issues
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            Self::from_message(&error.to_string())
        }
    }

    /// Categorize an error from its message text.
    pub fn from_message(message: &str) -> Self {
        let error_msg = message.to_lowercase();

        if error_msg.contains("certificate") || error_msg.contains("tls") || error_msg.contains("ssl")
        {
            ErrorCategory::TlsError
        } else if error_msg.contains("timeout") || error_msg.contains("timed out") {
            ErrorCategory::TimeoutError
        } else if error_msg.contains("dns")
            || error_msg.contains("resolve")
            || error_msg.contains("connect")
        {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::ExtractionError => "extraction_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::ExtractionError => "Response Extraction Errors",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Failure reported by the request primitive.
///
/// Never propagated out of a virtual user: the outcome tracker turns it into
/// a failed outcome.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{}] {message}", .category.label())]
pub struct TransportError {
    pub category: ErrorCategory,
    pub message: String,
}

impl TransportError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Message is URL-free with the cause chain appended, so failures group
    /// by cause rather than by rendered path.
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        let category = ErrorCategory::from_reqwest_error(&error);
        let error = error.without_url();
        let mut message = error.to_string();
        let mut source = std::error::Error::source(&error);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(category, message)
    }
}
