//! Metric instrument factories for hookq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"hookq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("hookq")
}

/// Counter: work items enqueued.
/// Labels: `result` ("ok" | "duplicate").
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("hookq.work.enqueued")
        .with_description("Number of work items enqueued")
        .build()
}

/// Counter: dispatch attempts by outcome.
/// Labels: `outcome` ("complete" | "delay" | "fail"), `http.response.status_code`.
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("hookq.work.dispatched")
        .with_description("Number of work item dispatch attempts")
        .build()
}

/// Counter: store operations (claim, complete, fail, delay, purge, ...).
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("hookq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: cron occurrences that enqueued work.
/// Labels: `job`.
pub fn cron_triggered() -> Counter<u64> {
    meter()
        .u64_counter("hookq.cron.triggered")
        .with_description("Number of cron occurrences fired")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("hookq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
