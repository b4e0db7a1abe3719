//! Prometheus metrics for monitoring the gateway.
//!
//! This module provides a centralized metrics registry with metric types for
//! tracking requests, admission decisions, cache behavior, provider health,
//! and billing totals.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by action and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by action
    pub active_requests: GaugeVec,

    /// Authentication failures by internal reason (never exposed to callers)
    pub auth_failures: IntCounterVec,

    /// Admission rejections by scope (origin vs identity)
    pub quota_rejections: IntCounterVec,

    /// Cache operations by kind (hit_fast, hit_durable, miss, store, rejected,
    /// backfill, evicted)
    pub cache_operations: IntCounterVec,

    /// Provider attempts by provider and outcome
    pub provider_attempts: IntCounterVec,

    /// Provider response latency histogram in seconds
    pub provider_latency: HistogramVec,

    /// Billing totals in micro-USD by kind (cost, savings, fee)
    pub usage_micro_usd: IntCounterVec,

    /// Usage records the durable sink failed to take, by reason
    pub usage_sink_dropped: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
///
/// # Examples
///
/// ```no_run
/// use onchain_gateway_rust::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.request_count.with_label_values(&["optimize", "200"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "gateway_requests_total",
            "Total number of requests",
            &["action", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "gateway_request_duration_seconds",
            "Request duration in seconds",
            &["action"],
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "gateway_active_requests",
            "Number of active requests",
            &["action"]
        )
        .expect("Failed to register active_requests metric");

        let auth_failures = register_int_counter_vec!(
            "gateway_auth_failures_total",
            "Authentication failures by reason",
            &["reason"]
        )
        .expect("Failed to register auth_failures metric");

        let quota_rejections = register_int_counter_vec!(
            "gateway_quota_rejections_total",
            "Admission rejections by scope",
            &["scope"]
        )
        .expect("Failed to register quota_rejections metric");

        let cache_operations = register_int_counter_vec!(
            "gateway_cache_operations_total",
            "Cache operations by kind",
            &["operation"]
        )
        .expect("Failed to register cache_operations metric");

        let provider_attempts = register_int_counter_vec!(
            "gateway_provider_attempts_total",
            "Provider attempts by provider and outcome",
            &["provider", "outcome"]
        )
        .expect("Failed to register provider_attempts metric");

        let provider_latency = register_histogram_vec!(
            "gateway_provider_latency_seconds",
            "Provider response latency in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register provider_latency metric");

        let usage_micro_usd = register_int_counter_vec!(
            "gateway_usage_micro_usd_total",
            "Billing totals in micro-USD by kind",
            &["kind"]
        )
        .expect("Failed to register usage_micro_usd metric");

        let usage_sink_dropped = register_int_counter_vec!(
            "gateway_usage_sink_dropped_total",
            "Usage records the durable sink failed to take",
            &["reason"]
        )
        .expect("Failed to register usage_sink_dropped metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            auth_failures,
            quota_rejections,
            cache_operations,
            provider_attempts,
            provider_latency,
            usage_micro_usd,
            usage_sink_dropped,
        }
    })
}

/// Get the global metrics instance.
///
/// # Panics
///
/// Panics if metrics have not been initialized via [`init_metrics`].
pub fn get_metrics() -> &'static Metrics {
    METRICS.get().expect("Metrics not initialized")
}

/// Get the global metrics instance if it has been initialized.
///
/// Components that also run in isolation (unit tests, library embedding) use
/// this so metric export stays optional for them.
pub fn try_get_metrics() -> Option<&'static Metrics> {
    METRICS.get()
}
