//! Poll cycle span helpers.

use tracing::Span;

use crate::model::SourceType;

/// Start a span covering one fetch-and-process pass for a source.
///
/// The result fields are declared empty and filled in by
/// [`record_cycle_result`].
pub fn start_cycle_span(source: SourceType) -> Span {
    tracing::info_span!(
        "poll.cycle",
        "poll.source" = source.as_str(),
        "poll.fetched" = tracing::field::Empty,
        "poll.emitted" = tracing::field::Empty,
        "poll.failed" = tracing::field::Empty,
        "poll.traced" = tracing::field::Empty,
    )
}

/// Record cycle counters on the given span.
pub fn record_cycle_result(span: &Span, fetched: usize, emitted: usize, failed: usize, traced: usize) {
    span.record("poll.fetched", fetched);
    span.record("poll.emitted", emitted);
    span.record("poll.failed", failed);
    span.record("poll.traced", traced);
}
