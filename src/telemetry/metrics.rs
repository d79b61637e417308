//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without [`super::init_telemetry`] and an endpoint, the global provider is
//! a no-op and recording costs next to nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq-harness")
}

/// Counter: execution queues created.
/// Labels: `policy`, `shared` ("true" | "false").
pub fn queues_created() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.created")
        .with_description("Number of execution queues created")
        .build()
}

/// Counter: work units submitted to a queue.
/// Labels: `queue`, `policy`.
pub fn units_submitted() -> Counter<u64> {
    meter()
        .u64_counter("workq.unit.submitted")
        .with_description("Number of work units submitted")
        .build()
}

/// Counter: work unit state transitions.
/// Labels: `from`, `to`.
pub fn unit_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.unit.state_transitions")
        .with_description("Number of work unit state transitions")
        .build()
}

/// Counter: cancellation requests that set a unit's flag.
pub fn unit_cancellations() -> Counter<u64> {
    meter()
        .u64_counter("workq.unit.cancellations")
        .with_description("Number of work unit cancellation requests")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `queue`, `state`.
pub fn unit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.unit.duration_ms")
        .with_description("Work unit execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: harness waits that hit their timeout.
/// Labels: `kind` ("unit" | "expectation").
pub fn harness_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("workq.harness.timeouts")
        .with_description("Number of harness waits that timed out")
        .build()
}
