//! Metric instrument factories for farm.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"farm"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for farm instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("farm")
}

/// Counter: completed poll cycles.
/// Labels: `source`, `result` ("ok" | "error").
pub fn poll_cycles() -> Counter<u64> {
    meter()
        .u64_counter("farm.poll.cycles")
        .with_description("Number of poll cycles per source")
        .build()
}

/// Counter: publish attempts for detected transitions.
/// Labels: `source`, `result` ("ok" | "serialization_error" | "publish_error").
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("farm.events.published")
        .with_description("Number of state-transition events published")
        .build()
}

/// Counter: span trees handed to the trace exporter.
/// Labels: `source`.
pub fn traces_exported() -> Counter<u64> {
    meter()
        .u64_counter("farm.traces.exported")
        .with_description("Number of run traces exported")
        .build()
}

/// Histogram: wall time of one fetch-and-process pass, in milliseconds.
/// Labels: `source`.
pub fn poll_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("farm.poll.duration_ms")
        .with_description("Poll cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}
