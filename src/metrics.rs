//! Prometheus metrics (`spec.md` §6 "Observability").
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines the metric name constants the spec requires, and provides an
//! axum middleware for API-gateway RED metrics plus direct recording
//! functions the registry/executors call on backend outcomes.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::model::{HealthStateKind, Operation};

// -- Metric name constants ----------------------------------------------------

pub const APIGW_REQUESTS_TOTAL: &str = "s3proxy_apigw_requests_total";
pub const APIGW_REQUEST_LATENCY_SECONDS: &str = "s3proxy_apigw_request_latency_seconds";
pub const BACKEND_STATE: &str = "s3proxy_backend_state";
pub const BACKEND_REQUESTS_TOTAL: &str = "s3proxy_backend_requests_total";
pub const BACKEND_LATENCY_SECONDS: &str = "s3proxy_backend_latency_seconds";
pub const BACKEND_BYTES_READ_TOTAL: &str = "s3proxy_backend_bytes_read_total";
pub const BACKEND_BYTES_WRITE_TOTAL: &str = "s3proxy_backend_bytes_write_total";
pub const AUTH_REQUESTS_TOTAL: &str = "s3proxy_auth_requests_total";
pub const AUTH_LATENCY_SECONDS: &str = "s3proxy_auth_latency_seconds";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(APIGW_REQUESTS_TOTAL, "Total requests handled by the API gateway");
    describe_histogram!(APIGW_REQUEST_LATENCY_SECONDS, "API gateway request latency in seconds");
    describe_gauge!(BACKEND_STATE, "Current health state per backend: 0=down, 1=probing, 2=up");
    describe_counter!(BACKEND_REQUESTS_TOTAL, "Total requests issued to a backend");
    describe_histogram!(BACKEND_LATENCY_SECONDS, "Per-backend operation latency in seconds");
    describe_counter!(BACKEND_BYTES_READ_TOTAL, "Total bytes read from a backend");
    describe_counter!(BACKEND_BYTES_WRITE_TOTAL, "Total bytes written to a backend");
    describe_counter!(AUTH_REQUESTS_TOTAL, "Total authentication attempts");
    describe_histogram!(AUTH_LATENCY_SECONDS, "Authentication latency in seconds");
}

fn state_value(state: HealthStateKind) -> f64 {
    match state {
        HealthStateKind::Down => 0.0,
        HealthStateKind::Probing => 1.0,
        HealthStateKind::Up => 2.0,
    }
}

/// Record a backend's current health state as a gauge (`spec.md` §4.1).
pub fn set_backend_state(backend_id: &str, state: HealthStateKind) {
    gauge!(BACKEND_STATE, "backend" => backend_id.to_string()).set(state_value(state));
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::PutObject => "PutObject",
        Operation::GetObject => "GetObject",
        Operation::HeadObject => "HeadObject",
        Operation::HeadBucket => "HeadBucket",
        Operation::DeleteObject => "DeleteObject",
        Operation::ListObjectsV2 => "ListObjectsV2",
        Operation::ListBuckets => "ListBuckets",
        Operation::CreateMultipartUpload => "CreateMultipartUpload",
        Operation::UploadPart => "UploadPart",
        Operation::CompleteMultipartUpload => "CompleteMultipartUpload",
        Operation::AbortMultipartUpload => "AbortMultipartUpload",
        Operation::ListMultipartUploads => "ListMultipartUploads",
        Operation::Unsupported => "Unsupported",
    }
}

/// Record one backend operation outcome: request count, latency, and
/// (for reads/writes) byte counters (`spec.md` §4.1/§4.3/§4.4).
pub fn record_backend_operation(
    backend_id: &str,
    op: Operation,
    status: &str,
    duration_secs: f64,
    bytes_read: u64,
    bytes_written: u64,
) {
    let operation = operation_name(op);
    counter!(
        BACKEND_REQUESTS_TOTAL,
        "backend" => backend_id.to_string(),
        "operation" => operation,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        BACKEND_LATENCY_SECONDS,
        "backend" => backend_id.to_string(),
        "operation" => operation
    )
    .record(duration_secs);
    if bytes_read > 0 {
        counter!(BACKEND_BYTES_READ_TOTAL, "backend" => backend_id.to_string()).increment(bytes_read);
    }
    if bytes_written > 0 {
        counter!(BACKEND_BYTES_WRITE_TOTAL, "backend" => backend_id.to_string()).increment(bytes_written);
    }
}

/// Record one authentication attempt (`spec.md` §4.2).
pub fn record_auth_attempt(outcome: &str, duration_secs: f64) {
    counter!(AUTH_REQUESTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
    histogram!(AUTH_LATENCY_SECONDS).record(duration_secs);
}

// -- API gateway middleware ---------------------------------------------------

/// Axum middleware recording the top-level API-gateway RED metrics.
/// Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(req: Request<axum::body::Body>, next: axum::middleware::Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    if path == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        APIGW_REQUESTS_TOTAL,
        "method" => method.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(APIGW_REQUEST_LATENCY_SECONDS, "method" => method).record(duration);

    response
}

/// `GET /metrics` — render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE.get().expect("Prometheus recorder not initialized");
    let body = handle.render();
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_value_orders_down_probing_up() {
        assert!(state_value(HealthStateKind::Down) < state_value(HealthStateKind::Probing));
        assert!(state_value(HealthStateKind::Probing) < state_value(HealthStateKind::Up));
    }

    #[test]
    fn operation_name_covers_every_variant() {
        assert_eq!(operation_name(Operation::PutObject), "PutObject");
        assert_eq!(operation_name(Operation::ListMultipartUploads), "ListMultipartUploads");
        assert_eq!(operation_name(Operation::Unsupported), "Unsupported");
    }
}
