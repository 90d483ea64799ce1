//! Business metrics for admission control.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `classbook_reservations_total{outcome}` - Booking outcomes (confirmed, pending, rejection reason)
//! - `classbook_cancellations_total` - Seats released by cancellation
//! - `classbook_holds_expired_total` - Pending holds released by the sweeper
//! - `classbook_viability_decisions_total{viability}` - One-shot session decisions
//! - `classbook_store_failures_total{operation}` - Store calls that exhausted their retries
//! - `classbook_invalid_hold_state_total` - Seat accounting faults
//!
//! ## Gauges
//! - `classbook_sessions_loaded` - Session books held in memory
//!
//! ## Histograms
//! - `classbook_admission_duration_seconds` - Time to answer a booking request

use classbook_core::types::{ReservationOutcome, Viability};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize and register all admission metric descriptions.
///
/// Call once at startup, before any metric is recorded.
pub fn register_admission_metrics() {
    describe_counter!(
        "classbook_reservations_total",
        "Booking requests by outcome (confirmed, pending, or the rejection reason)"
    );
    describe_counter!(
        "classbook_cancellations_total",
        "Reservations canceled and their seats released"
    );
    describe_counter!(
        "classbook_holds_expired_total",
        "Pending seat holds released after the hold timeout"
    );
    describe_counter!(
        "classbook_viability_decisions_total",
        "Session viability decisions emitted at the cutoff"
    );
    describe_counter!(
        "classbook_store_failures_total",
        "Store calls that failed after exhausting their retry budget"
    );
    describe_counter!(
        "classbook_invalid_hold_state_total",
        "Seat operations that addressed a missing or mismatched hold"
    );
    describe_gauge!(
        "classbook_sessions_loaded",
        "Class sessions with a seat book in memory"
    );
    describe_histogram!(
        "classbook_admission_duration_seconds",
        "Time taken to answer a booking request"
    );

    tracing::info!("Admission metrics registered");
}

/// Install the Prometheus recorder and describe all metrics.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_admission_metrics();
    Ok(handle)
}

/// Record the outcome of a booking request.
pub fn record_reservation_outcome(outcome: &ReservationOutcome, elapsed: Duration) {
    let label = match outcome {
        ReservationOutcome::Confirmed { .. } => "confirmed",
        ReservationOutcome::Pending { .. } => "pending",
        ReservationOutcome::Rejected { reason, .. } => reason.as_str(),
    };
    metrics::counter!("classbook_reservations_total", "outcome" => label).increment(1);
    metrics::histogram!("classbook_admission_duration_seconds").record(elapsed.as_secs_f64());
}

/// Record a released seat.
pub fn record_cancellation() {
    metrics::counter!("classbook_cancellations_total").increment(1);
}

/// Record pending holds released by the sweeper.
pub fn record_holds_expired(count: usize) {
    metrics::counter!("classbook_holds_expired_total").increment(count as u64);
}

/// Record a viability decision.
pub fn record_viability_decision(viability: Viability) {
    metrics::counter!("classbook_viability_decisions_total", "viability" => viability.as_str())
        .increment(1);
}

/// Record a store call that exhausted its retries.
pub fn record_store_failure(operation: &'static str) {
    metrics::counter!("classbook_store_failures_total", "operation" => operation).increment(1);
}

/// Record a seat accounting fault.
pub fn record_invalid_hold_state() {
    metrics::counter!("classbook_invalid_hold_state_total").increment(1);
}

/// Update the number of session books in memory.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_loaded(count: usize) {
    metrics::gauge!("classbook_sessions_loaded").set(count as f64);
}
