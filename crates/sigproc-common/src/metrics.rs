//! Metrics for signal processing observability
//!
//! Provides OpenTelemetry metrics for:
//! - Phase processing (counts and durations per phase)
//! - Kubernetes enrichment (outcomes, error types, durations)
//! - Audit emission (dropped events)
//!
//! Instruments are recorded as side effects only; the exporter is configured
//! by [`crate::telemetry`].

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

/// Global meter for signal processing metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("signalprocessing"));

// ============================================================================
// Processing Metrics
// ============================================================================

/// Counter of phase processing attempts
///
/// Labels:
/// - `phase`: pending, enriching, classifying, categorizing
/// - `result`: success, failure
pub static PROCESSING_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signalprocessing_processing_total")
        .with_description("Total number of phase processing attempts")
        .with_unit("{attempts}")
        .build()
});

/// Histogram of phase processing duration
///
/// Labels:
/// - `phase`: pending, enriching, classifying, categorizing
pub static PROCESSING_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("signalprocessing_processing_duration_seconds")
        .with_description("Duration of phase processing in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Enrichment Metrics
// ============================================================================

/// Counter of enrichment passes
///
/// Labels:
/// - `result`: success, degraded
pub static ENRICHMENT_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signalprocessing_enrichment_total")
        .with_description("Total number of Kubernetes context enrichments")
        .with_unit("{enrichments}")
        .build()
});

/// Counter of enrichment lookup errors
///
/// Labels:
/// - `error_type`: not_found, forbidden, timeout, api
pub static ENRICHMENT_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signalprocessing_enrichment_errors_total")
        .with_description("Total number of Kubernetes enrichment lookup errors")
        .with_unit("{errors}")
        .build()
});

/// Histogram of enrichment duration
///
/// Labels:
/// - `result`: success, degraded
pub static ENRICHMENT_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("signalprocessing_enrichment_duration_seconds")
        .with_description("Duration of Kubernetes context enrichment in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Audit Metrics
// ============================================================================

/// Counter of audit events dropped because the buffer was full or closed
pub static AUDIT_EVENTS_DROPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signalprocessing_audit_events_dropped_total")
        .with_description("Total number of audit events dropped before delivery")
        .with_unit("{events}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Outcome label shared by processing and enrichment metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The step completed normally
    Success,
    /// The step completed with partial data
    Degraded,
    /// The step failed
    Failure,
}

impl Outcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Degraded => "degraded",
            Self::Failure => "failure",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one phase of processing
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    /// Start timing the given phase (label value)
    pub fn start(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    /// Record completion with the given outcome
    pub fn finish(self, outcome: Outcome) {
        PROCESSING_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("phase", self.phase)],
        );
        PROCESSING_TOTAL.add(
            1,
            &[
                KeyValue::new("phase", self.phase),
                KeyValue::new("result", outcome.as_str()),
            ],
        );
    }
}

/// Times one enrichment pass
pub struct EnrichmentTimer {
    start: Instant,
}

impl EnrichmentTimer {
    /// Start timing an enrichment pass
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record completion; `degraded` selects the result label
    pub fn finish(self, degraded: bool) {
        let outcome = if degraded {
            Outcome::Degraded
        } else {
            Outcome::Success
        };
        ENRICHMENT_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", outcome.as_str())],
        );
        ENRICHMENT_TOTAL.add(1, &[KeyValue::new("result", outcome.as_str())]);
    }
}

/// Record one enrichment lookup error
pub fn record_enrichment_error(error_type: &'static str) {
    ENRICHMENT_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
}

/// Record one dropped audit event
pub fn record_audit_dropped(reason: &'static str) {
    AUDIT_EVENTS_DROPPED.add(1, &[KeyValue::new("reason", reason)]);
}
