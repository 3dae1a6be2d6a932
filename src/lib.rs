//! # hubsync
//!
//! Event synchronization core of a webhook-to-chat integration hub.
//!
//! Incoming webhooks from external services are normalized by a
//! [`adapter::ServiceAdapter`], deduplicated, and projected onto chat
//! messages by the [`engine::SyncEngine`]. The [`index::EventIndex`] ties
//! every event id to the message that represents it, the
//! [`cache::CacheStore`] holds TTL state, and the [`jobs::JobQueue`] runs
//! outbound writes with Fibonacci retry. Both SQLite ([`storage`]) and
//! Postgres ([`db`]) backends are provided.

pub mod adapter;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod flags;
pub mod hub;
pub mod index;
pub mod jobs;
pub mod journal;
pub mod model;
pub mod outbound;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod transport;
