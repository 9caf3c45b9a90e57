//! Prometheus registry of the server.
//!
//! HTTP request metrics live here; engine metrics come from
//! [`jobgen_core::metrics::all_metrics`]. Pool gauges are refreshed on scrape.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "jobgen_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobgen_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// =============================================================================
// Generator Pool Metrics (collected dynamically)
// =============================================================================

/// Pool running state (1 = running, 0 = stopped).
pub static POOL_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobgen_generator_pool_running",
        "Whether the generator pool is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Unix time of the last tick of each generator.
pub static GENERATOR_LAST_TICK: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "jobgen_generator_last_tick_timestamp_seconds",
            "Time of the last tick per task table",
        ),
        &["task_table"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry.register(Box::new(POOL_RUNNING.clone())).unwrap();
    registry
        .register(Box::new(GENERATOR_LAST_TICK.clone()))
        .unwrap();

    for metric in jobgen_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Refresh the pool gauges before a scrape.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let status = state.pool().status().await;
    POOL_RUNNING.set(if status.running { 1 } else { 0 });
    for generator in status.generators {
        if let Some(last_tick) = generator.last_tick {
            GENERATOR_LAST_TICK
                .with_label_values(&[&generator.task_table])
                .set(last_tick.timestamp());
        }
    }
}

/// Normalize a path for metric labels (numeric ids become placeholders).
pub fn normalize_path(path: &str) -> String {
    static NUMERIC: Lazy<regex_lite::Regex> =
        Lazy::new(|| regex_lite::Regex::new(r"/\d+(/|$)").unwrap());
    NUMERIC.replace_all(path, "/{id}$1").to_string()
}
