//! Job execution span helpers.

use tracing::Span;

use crate::model::job::JobId;

/// Start a span for one job attempt.
///
/// The `job.state` field is declared empty and is filled by
/// [`record_state_transition`].
pub fn start_job_span(handler: &str, id: JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.handler" = handler,
        "job.id" = %id,
        "job.attempt" = attempt,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
