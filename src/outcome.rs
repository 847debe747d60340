//! Outcome tracking: classification of one action invocation.
//!
//! Classification is pure. Given what the transport returned and the
//! caller's [`StatusExpectation`], it produces an [`Outcome`] carrying a
//! human-readable failure reason when unsuccessful. Transport errors and
//! timeouts become failed outcomes here; nothing in this module can fail.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::errors::{ErrorCategory, TransportError};
use crate::transport::Reply;

/// Which status codes count as success for an action.
///
/// The default accepts any 2xx/3xx. Specific sets replace that default, and
/// `also_accept` whitelists extra codes on top (e.g. a tolerated 404).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusExpectation {
    exact: Option<BTreeSet<u16>>,
    also_accept: BTreeSet<u16>,
}

impl StatusExpectation {
    /// Any 2xx or 3xx status.
    pub fn success() -> Self {
        Self::default()
    }

    /// Only the listed statuses.
    pub fn exactly(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            exact: Some(statuses.into_iter().collect()),
            also_accept: BTreeSet::new(),
        }
    }

    /// Additionally accept the listed statuses.
    pub fn also(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.also_accept.extend(statuses);
        self
    }

    pub fn accepts(&self, status: u16) -> bool {
        if self.also_accept.contains(&status) {
            return true;
        }
        match &self.exact {
            Some(set) => set.contains(&status),
            None => (200..=399).contains(&status),
        }
    }
}

/// Classified result of one action invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub succeeded: bool,
    pub status_code: Option<u16>,
    pub latency: Duration,
    pub error_detail: Option<String>,
    pub category: Option<ErrorCategory>,
}

impl Outcome {
    pub fn success(status_code: u16, latency: Duration) -> Self {
        Self {
            succeeded: true,
            status_code: Some(status_code),
            latency,
            error_detail: None,
            category: None,
        }
    }

    pub fn failure(
        category: ErrorCategory,
        status_code: Option<u16>,
        latency: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            succeeded: false,
            status_code,
            latency,
            error_detail: Some(reason.into()),
            category: Some(category),
        }
    }

    /// Classify a transport result against an expectation.
    ///
    /// `elapsed` is the time measured around the call; it is used when the
    /// transport could not report its own latency.
    pub fn classify(
        result: &Result<Reply, TransportError>,
        elapsed: Duration,
        expectation: &StatusExpectation,
    ) -> Self {
        match result {
            Ok(reply) if expectation.accepts(reply.status) => {
                Self::success(reply.status, reply.latency)
            }
            Ok(reply) => Self::failure(
                ErrorCategory::from_status_code(reply.status).unwrap_or(ErrorCategory::OtherError),
                Some(reply.status),
                reply.latency,
                format!("unexpected status {}", reply.status),
            ),
            Err(error) => Self::failure(error.category, None, elapsed, error.message.clone()),
        }
    }

    /// Outcome for a request abandoned after the configured `timeout`.
    ///
    /// The reason names the limit, not the measured `elapsed`, so every
    /// timeout of an action lands in one failure row.
    pub fn timed_out(timeout: Duration, elapsed: Duration) -> Self {
        Self::failure(
            ErrorCategory::TimeoutError,
            None,
            elapsed,
            format!("request timed out after {}ms", timeout.as_millis()),
        )
    }

    /// Turn a successful outcome into a failure because post-processing of
    /// the response body failed.
    pub fn into_extraction_failure(self, reason: impl Into<String>) -> Self {
        Self::failure(
            ErrorCategory::ExtractionError,
            self.status_code,
            self.latency,
            reason,
        )
    }

    /// Failure reason for reports, empty for successes.
    pub fn reason(&self) -> &str {
        self.error_detail.as_deref().unwrap_or("")
    }
}
