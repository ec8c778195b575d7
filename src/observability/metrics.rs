//! Metrics collection and exposition.
//!
//! # Metrics
//! - `client_requests_total` (counter): dispatched calls by service, outcome
//! - `client_request_duration_seconds` (histogram): transport latency
//! - `client_circuit_transitions_total` (counter): breaker state changes
//! - `client_queue_depth` (gauge): pending entries in the offline queue
//! - `client_queue_dead_letters_total` (counter): entries surfaced as failed
//! - `client_dedup_hits_total` (counter): callers that joined an in-flight call
//! - `client_batch_size` (histogram): keys per dispatched batch

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with its HTTP listener.
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(service: &str, outcome: &'static str, start: Instant) {
    counter!(
        "client_requests_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("client_request_duration_seconds", "service" => service.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_circuit_transition(service: &str, from: &'static str, to: &'static str) {
    counter!(
        "client_circuit_transitions_total",
        "service" => service.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

pub fn record_queue_depth(pending: usize) {
    gauge!("client_queue_depth").set(pending as f64);
}

pub fn record_dead_letter(service: &str) {
    counter!("client_queue_dead_letters_total", "service" => service.to_string()).increment(1);
}

pub fn record_dedup_hit() {
    counter!("client_dedup_hits_total").increment(1);
}

pub fn record_batch(service: &str, size: usize) {
    histogram!("client_batch_size", "service" => service.to_string()).record(size as f64);
}
