//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations by resulting phase
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "database_operator_reconciliations_total",
        "Total number of reconciliations by resulting phase",
        &["phase"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "database_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["phase"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Applier outcomes by dependent kind
    pub static ref APPLY_OUTCOMES: CounterVec = register_counter_vec!(
        "database_operator_apply_outcomes_total",
        "Outcomes of dependent object applies",
        &["kind", "outcome"]
    ).unwrap();

    /// Retries scheduled for degraded intents
    pub static ref RETRIES_SCHEDULED: CounterVec = register_counter_vec!(
        "database_operator_retries_scheduled_total",
        "Number of retries scheduled for degraded intents",
        &["namespace"]
    ).unwrap();

    /// Watch restarts by reason (ended, error, relist)
    pub static ref WATCH_RESTARTS: CounterVec = register_counter_vec!(
        "database_operator_watch_restarts_total",
        "Number of watch reconnects and relists",
        &["reason"]
    ).unwrap();

    /// Status reports that could not be written
    pub static ref STATUS_REPORT_ERRORS: CounterVec = register_counter_vec!(
        "database_operator_status_report_errors_total",
        "Number of failed status subresource updates",
        &["namespace"]
    ).unwrap();

    /// Intents by current phase
    pub static ref INTENTS: GaugeVec = register_gauge_vec!(
        "database_operator_intents",
        "Number of tracked Database resources by phase",
        &["phase"]
    ).unwrap();

    /// Reconciliations currently running
    pub static ref IN_FLIGHT: prometheus::Gauge = prometheus::register_gauge!(
        "database_operator_reconciliations_in_flight",
        "Number of reconciliations currently running"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "database_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Set once the watcher has established its baseline listing
static READY: AtomicBool = AtomicBool::new(false);

/// Mark the operator ready to serve
pub fn mark_ready() {
    READY.store(true, Ordering::Relaxed);
}

/// Start the metrics HTTP server; returns when `shutdown` is cancelled
pub async fn serve(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" if OPERATOR_HEALTH.get() > 0.0 => text(StatusCode::OK, "ok"),
        "/healthz" | "/health" => text(StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        "/readyz" | "/ready" if READY.load(Ordering::Relaxed) => text(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// Plain text response
fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
