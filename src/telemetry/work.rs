//! Dispatch span helpers.

use tracing::Span;

use crate::model::WorkItem;

/// Start a span covering one claimed item's dispatch and settlement.
///
/// `work.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_dispatch_span(item: &WorkItem) -> Span {
    tracing::info_span!(
        "work.dispatch",
        "work.id" = %item.id,
        "work.queue" = %item.queue_name,
        "work.shard" = %item.shard,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record how a dispatch was settled.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "work settled");
    });
}
