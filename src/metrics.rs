use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

use crate::journey::JourneyState;
use crate::outcome::Outcome;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "swarm_loadtest".to_string());

    // === Request Metrics ===

    pub static ref REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_total", "Total number of actions executed")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["user_type", "action", "result"]  // result: success, failure
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP responses by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_ERRORS_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_errors_by_category", "Failed actions by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "Action latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["user_type", "action"]
        ).unwrap();

    // === User Metrics ===

    pub static ref LIVE_USERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("live_users", "Number of virtual users currently running")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref LIVE_USERS_BY_TYPE: IntGaugeVec =
        IntGaugeVec::new(
            Opts::new("live_users_by_type", "Number of running virtual users per user type")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["user_type"]
        ).unwrap();

    // === Journey Metrics ===

    pub static ref JOURNEY_CYCLES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("journey_cycles_total", "Journey cycles by terminal state")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["journey", "status"]  // status: completed, aborted
        ).unwrap();

    pub static ref JOURNEY_STEPS_SKIPPED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("journey_steps_skipped_total", "Journey steps skipped for unmet preconditions")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["journey", "step"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();

    registry.register(Box::new(REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUEST_ERRORS_BY_CATEGORY.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;

    registry.register(Box::new(LIVE_USERS.clone()))?;
    registry.register(Box::new(LIVE_USERS_BY_TYPE.clone()))?;

    registry.register(Box::new(JOURNEY_CYCLES_TOTAL.clone()))?;
    registry.register(Box::new(JOURNEY_STEPS_SKIPPED_TOTAL.clone()))?;

    Ok(())
}

/// Mirror one outcome into the Prometheus series.
pub fn observe_outcome(user_type: &str, action: &str, outcome: &Outcome) {
    let result = if outcome.succeeded { "success" } else { "failure" };
    REQUESTS_TOTAL
        .with_label_values(&[user_type, action, result])
        .inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[user_type, action])
        .observe(outcome.latency.as_secs_f64());
    let status = outcome.status_code.map_or("error", status_code_label);
    REQUEST_STATUS_CODES.with_label_values(&[status]).inc();
    if let Some(category) = outcome.category {
        REQUEST_ERRORS_BY_CATEGORY
            .with_label_values(&[category.label()])
            .inc();
    }
}

/// Returns a static string label for common HTTP status codes.
///
/// Avoids a heap `String` allocation on every request in the hot path.
/// Uncommon codes fall back to "other" rather than allocating a unique string.
fn status_code_label(code: u16) -> &'static str {
    match code {
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        409 => "409",
        422 => "422",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}

pub fn observe_journey_cycle(journey: &str, state: JourneyState) {
    let status = match state {
        JourneyState::Completed => "completed",
        JourneyState::Aborted { .. } => "aborted",
        _ => return,
    };
    JOURNEY_CYCLES_TOTAL
        .with_label_values(&[journey, status])
        .inc();
}

pub fn observe_step_skipped(journey: &str, step: &str) {
    JOURNEY_STEPS_SKIPPED_TOTAL
        .with_label_values(&[journey, step])
        .inc();
}

fn encode(registry: &Mutex<Registry>) -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let mut response = match encode(&registry) {
        Ok(buffer) => Response::new(Body::from(buffer)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            let mut response = Response::new(Body::from("failed to encode metrics"));
            *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            return Ok(response);
        }
    };
    if let Ok(content_type) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    match encode(registry) {
        Ok(buffer) => String::from_utf8(buffer).unwrap_or_else(|e| {
            error!(error = %e, "Error encoding metrics to UTF-8");
            String::from("# ERROR ENCODING METRICS TO UTF-8")
        }),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            String::from("# ERROR ENCODING METRICS")
        }
    }
}
