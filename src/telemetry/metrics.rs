//! Metric instrument factories for hubsync.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"hubsync"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for hubsync instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("hubsync")
}

/// Counter: webhook deliveries.
/// Labels: `service`, `result` (the ingest outcome label, e.g. "created",
/// "duplicate", "deferred", or "error").
pub fn webhook_events() -> Counter<u64> {
    meter()
        .u64_counter("hubsync.webhook.events")
        .with_description("Number of webhook deliveries by outcome")
        .build()
}

/// Counter: chat-side writes.
/// Labels: `operation` ("send" | "edit" | "reply").
pub fn chat_messages() -> Counter<u64> {
    meter()
        .u64_counter("hubsync.chat.messages")
        .with_description("Number of chat messages sent or edited")
        .build()
}

/// Counter: job attempt outcomes.
/// Labels: `handler`, `outcome` ("finished" | "retried" | "failed").
pub fn jobs_completed() -> Counter<u64> {
    meter()
        .u64_counter("hubsync.jobs.completed")
        .with_description("Number of job attempts by outcome")
        .build()
}

/// Histogram: duration of one job attempt in milliseconds.
/// Labels: `handler`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("hubsync.jobs.duration_ms")
        .with_description("Job attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: cache-first fetches.
/// Labels: `result` ("hit" | "miss").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("hubsync.cache.lookups")
        .with_description("Number of cache-first lookups")
        .build()
}

/// Counter: event ids that were already claimed by another message.
pub fn index_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("hubsync.index.conflicts")
        .with_description("Event index claim collisions")
        .build()
}
