//! Prometheus metrics recording.

use crate::cluster::store::StateMachineStore;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Records HTTP request metrics.
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Records a write command submitted to the log.
pub fn record_command(op: &str) {
    counter!("annex_commands_total", "op" => op.to_string()).increment(1);
}

/// Updates index-level gauges from the local replica.
pub fn update_index_metrics(sm: &StateMachineStore) {
    gauge!("annex_vectors_total").set(sm.vector_count() as f64);
}
