//! Error types for hubsync.
//!
//! The variants double as the error taxonomy of the synchronization core:
//! job handlers classify their failures by returning one of them, and the
//! job queue decides between retry and terminal failure with
//! [`Error::is_retryable`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network failure or 5xx/429 from an external API. Retried by the job queue.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Expired or revoked credential. Never retried; triggers re-authorization.
    #[error("credential for {service} is invalid: {message}")]
    AuthInvalid { service: String, message: String },

    /// Terminal rejection from an external API (non-auth 4xx).
    #[error("upstream rejected request (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    /// An event id is already claimed by a different message.
    #[error("event {event_id} in chat {chat} already belongs to message {existing}, not {attempted}")]
    Conflict {
        chat: i64,
        event_id: String,
        existing: i64,
        attempted: i64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// An adapter could not parse a webhook body or a job could not decode its arguments.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("no handler registered under {0:?}")]
    UnknownHandler(String),

    #[error("deadline exceeded after {0:?}; job {1} continues in the background")]
    DeadlineExceeded(std::time::Duration, String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the job queue should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientUpstream(_) | Error::StoreUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Error::StoreUnavailable(e.to_string())
            }
            other => Error::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
