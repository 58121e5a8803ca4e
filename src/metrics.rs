//! Prometheus metrics.
//!
//! The recorder is installed once per process by [`init`]; the helpers below
//! are no-ops until then, so library code and tests can call them freely.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder and return its render handle.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_global_recorder(recorder) {
                warn!("Metrics recorder already installed: {}", e);
            }
            handle
        })
        .clone()
}

/// Prometheus text exposition of everything recorded so far.
pub fn render() -> String {
    HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

pub fn record_request(route: &str, status: u16) {
    counter!(
        "offgrid_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(route: &str, start: Instant) {
    histogram!("offgrid_request_duration_seconds", "route" => route.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_hit() {
    counter!("offgrid_cache_hits_total").increment(1);
}

pub fn record_cache_miss() {
    counter!("offgrid_cache_misses_total").increment(1);
}

pub fn record_upstream_error() {
    counter!("offgrid_upstream_errors_total").increment(1);
}
