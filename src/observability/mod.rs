// src/observability/mod.rs
// Structured logging, Prometheus metrics, and content-gated span attributes

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Global Prometheus handle for metrics rendering
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Configure the tracing subscriber. `RUST_LOG` drives the filter; default `info`.
pub fn configure_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Initialize the Prometheus metrics exporter
pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    PROMETHEUS_HANDLE
        .set(handle)
        .expect("Prometheus handle already initialized");
}

/// GET /metrics - Prometheus metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Record an inbound reasoning request (counter)
pub fn record_request(transport: &str) {
    counter!("cogito_requests_total", "transport" => transport.to_string()).increment(1);
}

/// Record a failed reasoning request (counter)
pub fn record_error(transport: &str) {
    counter!("cogito_errors_total", "transport" => transport.to_string()).increment(1);
}

/// Record request latency in milliseconds (histogram)
pub fn record_latency(transport: &str, latency_ms: f64) {
    histogram!("cogito_latency_ms", "transport" => transport.to_string()).record(latency_ms);
}

/// Record the number of context chunks retrieved for a request (histogram)
pub fn record_context_size(chunks: usize) {
    histogram!("cogito_context_chunks").record(chunks as f64);
}

/// Attach message bodies to the current span, but only when content tracing
/// was switched on. The fields must be declared `Empty` on span creation.
///
/// This gate is a security contract: with the flag off (the default) no span
/// attribute may carry user or assistant message content.
pub fn record_content(span: &tracing::Span, field: &str, content: &str, content_tracing: bool) {
    if !content_tracing {
        return;
    }
    span.record(field, content);
}
