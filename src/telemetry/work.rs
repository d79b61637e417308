//! Work unit execution span helpers.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for one work unit executing on a queue.
///
/// The `work.state` field is declared empty and is filled by
/// [`record_state_transition`].
pub fn start_unit_span(queue: &str, id: &WorkId, name: &str) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.queue" = queue,
        "work.id" = %id,
        "work.name" = name,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
