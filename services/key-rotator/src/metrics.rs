//! Prometheus metrics exposition
//!
//! Service-level metrics:
//!
//! - `key_rotator_acquire_duration_seconds` (histogram): label `outcome`
//! - `key_rotator_leases_active` (gauge)
//!
//! The pool library emits `key_pool_acquire_total`, `key_pool_rotations_total`
//! and `key_pool_corrupt_records_total` through the same recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const ACQUIRE_DURATION: &str = "key_rotator_acquire_duration_seconds";

/// Buckets from 100µs to 1s: an in-memory acquire sits at the bottom, a
/// Redis-backed scan over a large pool at the top.
const ACQUIRE_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(ACQUIRE_DURATION.to_string()), ACQUIRE_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record how long an acquire took and how it ended
/// (`granted`, `exhausted`, `empty`, `error`).
pub fn record_acquire(outcome: &'static str, duration_secs: f64) {
    metrics::histogram!(ACQUIRE_DURATION, "outcome" => outcome).record(duration_secs);
}

/// Publish the number of unreleased leases.
pub fn set_active_leases(count: usize) {
    metrics::gauge!("key_rotator_leases_active").set(count as f64);
}
