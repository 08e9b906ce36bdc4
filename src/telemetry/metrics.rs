//! Metric instrument factories for jobrun-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobrun-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("jobrun-rs")
}

/// Counter: events accepted by the router.
/// Labels: `source`, `result` ("new" | "duplicate").
pub fn events_ingested() -> Counter<u64> {
    meter()
        .u64_counter("jobrun.events.ingested")
        .with_description("Number of events accepted for delivery")
        .build()
}

/// Counter: delivery attempts.
/// Labels: `result` ("delivered" | "retry" | "exhausted").
pub fn event_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("jobrun.events.deliveries")
        .with_description("Number of event delivery attempts")
        .build()
}

/// Counter: executions created.
/// Labels: `job`, `result` ("new" | "duplicate" | "auth_failed").
pub fn executions_created() -> Counter<u64> {
    meter()
        .u64_counter("jobrun.executions.created")
        .with_description("Number of executions created")
        .build()
}

/// Counter: execution state transitions.
/// Labels: `from`, `to`.
pub fn execution_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobrun.executions.state_transitions")
        .with_description("Number of execution state transitions")
        .build()
}

/// Counter: task ledger outcomes.
/// Labels: `outcome` ("executed" | "cached" | "errored" | "suspended" | "conflict" | "noop").
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("jobrun.tasks.outcomes")
        .with_description("Number of task ledger outcomes")
        .build()
}

/// Histogram: side-effect duration in milliseconds.
/// Labels: `task`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobrun.tasks.duration_ms")
        .with_description("Task side-effect duration in milliseconds")
        .with_unit("ms")
        .build()
}
