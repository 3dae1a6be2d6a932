//! SQLite storage backend.
//!
//! Single-node backend for the event index, the cache and the job queue.
//! WAL mode for concurrent readers; one connection guarded by a mutex, so
//! every write is serialized and each trait method runs as one short
//! transaction. Timestamps are stored as Unix milliseconds.
//!
//! Statements run synchronously on the calling runtime thread and the lock is
//! never held across an `.await`. Under heavy webhook load that contention
//! parks runtime workers; such deployments should use the Postgres backend
//! ([`crate::db`]), which is fully async.

mod cache;
mod index;
mod jobs;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Use `clock` for cache expiry and record timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn init(&self) -> Result<()> {
        self.with_conn(|conn| {
            // WAL mode for concurrent readers
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;

            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS messages (
                    chat_id         INTEGER NOT NULL,
                    message_id      INTEGER NOT NULL,
                    text            TEXT NOT NULL,
                    reply_to        INTEGER,
                    reply_action    TEXT,
                    buttons         TEXT NOT NULL DEFAULT '[]',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    PRIMARY KEY (chat_id, message_id)
                );

                CREATE TABLE IF NOT EXISTS events (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    chat_id         INTEGER NOT NULL,
                    event_id        TEXT NOT NULL,
                    message_id      INTEGER NOT NULL,
                    created_at      INTEGER NOT NULL,
                    UNIQUE (chat_id, event_id)
                );

                CREATE INDEX IF NOT EXISTS idx_events_message ON events(chat_id, message_id, seq);

                CREATE TABLE IF NOT EXISTS cache (
                    scope           TEXT NOT NULL,
                    key             TEXT NOT NULL,
                    value           TEXT NOT NULL,
                    expires_at      INTEGER NOT NULL,
                    PRIMARY KEY (scope, key)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id              TEXT PRIMARY KEY,
                    handler         TEXT NOT NULL,
                    pool            TEXT NOT NULL,
                    args            TEXT NOT NULL DEFAULT '[]',
                    state           TEXT NOT NULL DEFAULT 'queued',
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    max_attempts    INTEGER NOT NULL,
                    run_at          INTEGER NOT NULL,
                    inline          INTEGER NOT NULL DEFAULT 0,
                    last_error      TEXT,
                    result          TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    finished_at     INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, updated_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(run_at)
                    WHERE state = 'queued' AND inline = 0;

                CREATE TABLE IF NOT EXISTS journal (
                    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp   INTEGER NOT NULL,
                    kind        TEXT NOT NULL
                );
                ",
            )?;
            Ok(())
        })
    }

    /// Run `f` against the connection. A poisoned lock means a previous
    /// writer panicked mid-statement; the store is reported unavailable.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("sqlite connection lock poisoned".to_string()))?;
        f(&mut conn)
    }

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}
