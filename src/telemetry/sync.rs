//! Span helpers for event synchronization.

use tracing::Span;

/// Start a span covering one canonical event's trip through the engine.
///
/// `sync.outcome` is filled by [`record_outcome`].
pub fn start_sync_span(chat: i64, service: &str, action_id: &str) -> Span {
    tracing::info_span!(
        "sync.event",
        "sync.chat" = chat,
        "sync.service" = service,
        "sync.action_id" = action_id,
        "sync.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("sync.outcome", outcome);
}
