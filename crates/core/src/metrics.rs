//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Generators (ticks, stage transitions, rollbacks)
//! - Input resolution (metadata queries, timed out inputs)
//! - Publishing and upstream consumption
//! - External services (catalog, metadata, bus)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Generator Metrics
// =============================================================================

/// Generator ticks by outcome.
pub static GENERATOR_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobgen_generator_ticks_total", "Total generator ticks"),
        &["task_table", "outcome"], // "idle", "advanced", "rolled_back", "conflict", "error"
    )
    .unwrap()
});

/// Successful stage transitions.
pub static STAGE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "jobgen_stage_transitions_total",
            "Total generation state transitions",
        ),
        &["from", "to"],
    )
    .unwrap()
});

/// Failed stage actions.
pub static STAGE_ROLLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobgen_stage_rollbacks_total", "Total failed stage actions"),
        &["task_table", "state"],
    )
    .unwrap()
});

/// Stage action duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "jobgen_stage_duration_seconds",
            "Duration of generation stage actions",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["state"],
    )
    .unwrap()
});

// =============================================================================
// Input Resolution Metrics
// =============================================================================

/// Metadata queries by status.
pub static METADATA_QUERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobgen_metadata_queries_total", "Total metadata queries"),
        &["status"], // "found", "empty", "error", "cached"
    )
    .unwrap()
});

/// Optional inputs dropped after their waiting time.
pub static INPUTS_TIMED_OUT: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "jobgen_inputs_timed_out_total",
        "Total optional inputs dropped after timeout",
    )
    .unwrap()
});

// =============================================================================
// Publishing and Consumption Metrics
// =============================================================================

/// Published execution jobs.
pub static JOBS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobgen_jobs_published_total", "Total published execution jobs"),
        &["family"],
    )
    .unwrap()
});

/// Upstream messages handled by consumers.
pub static MESSAGES_CONSUMED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "jobgen_messages_consumed_total",
            "Total upstream messages handled",
        ),
        &["category", "outcome"], // "ok", "error", "filtered", "invalid"
    )
    .unwrap()
});

// =============================================================================
// External Service Metrics
// =============================================================================

/// External service request duration.
pub static EXTERNAL_SERVICE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "jobgen_external_service_duration_seconds",
            "Duration of external service calls",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["service", "operation"],
    )
    .unwrap()
});

/// External service requests total.
pub static EXTERNAL_SERVICE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "jobgen_external_service_requests_total",
            "Total external service requests",
        ),
        &["service", "operation", "status"], // status: "success", "error"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Record one external call.
pub fn observe_external_call(service: &str, operation: &str, ok: bool, seconds: f64) {
    let status = if ok { "success" } else { "error" };
    EXTERNAL_SERVICE_REQUESTS
        .with_label_values(&[service, operation, status])
        .inc();
    EXTERNAL_SERVICE_DURATION
        .with_label_values(&[service, operation])
        .observe(seconds);
}

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Generators
        Box::new(GENERATOR_TICKS.clone()),
        Box::new(STAGE_TRANSITIONS.clone()),
        Box::new(STAGE_ROLLBACKS.clone()),
        Box::new(STAGE_DURATION.clone()),
        // Resolution
        Box::new(METADATA_QUERIES.clone()),
        Box::new(INPUTS_TIMED_OUT.clone()),
        // Publishing / consumption
        Box::new(JOBS_PUBLISHED.clone()),
        Box::new(MESSAGES_CONSUMED.clone()),
        // External services
        Box::new(EXTERNAL_SERVICE_DURATION.clone()),
        Box::new(EXTERNAL_SERVICE_REQUESTS.clone()),
    ]
}
