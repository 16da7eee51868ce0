//! OpenTelemetry metrics for policy evaluation and reloads

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("signalprocessing"));

/// Counter of policy evaluations
///
/// Labels:
/// - `policy`: engine name (environment, priority, business, severity, custom_labels)
/// - `result`: success, default, no_match, evaluation, timeout
pub static POLICY_EVALUATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signalprocessing_policy_evaluations_total")
        .with_description("Total number of policy evaluations")
        .with_unit("{evaluations}")
        .build()
});

/// Histogram of policy evaluation duration
///
/// Labels:
/// - `policy`: engine name
pub static POLICY_EVALUATION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("signalprocessing_policy_evaluation_duration_seconds")
        .with_description("Duration of policy evaluations")
        .with_unit("s")
        .build()
});

/// Counter of policy reload attempts
///
/// Labels:
/// - `policy`: engine name
/// - `result`: success, rejected, io
pub static POLICY_RELOADS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signalprocessing_policy_reloads_total")
        .with_description("Total number of policy reload attempts")
        .with_unit("{reloads}")
        .build()
});

pub(crate) fn record_evaluation(policy: &str, result: &'static str, seconds: f64) {
    let policy = KeyValue::new("policy", policy.to_string());
    POLICY_EVALUATIONS.add(1, &[policy.clone(), KeyValue::new("result", result)]);
    POLICY_EVALUATION_DURATION.record(seconds, &[policy]);
}

pub(crate) fn record_reload(policy: &str, result: &'static str) {
    POLICY_RELOADS.add(
        1,
        &[
            KeyValue::new("policy", policy.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
