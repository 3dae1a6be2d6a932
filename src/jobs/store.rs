//! Persistence contract for the job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::journal::{JournalEntry, JournalKind};
use crate::model::job::{Job, JobId, JobState, JobUpdate};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// `Error::NotFound` if the id is unknown.
    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// Move a job from `from` to `to`, applying `update` in the same write.
    ///
    /// Compare-and-set on the current state: if the job is not in `from`
    /// (someone else claimed it, or it already finished) the call fails with
    /// `Error::InvalidTransition` and nothing changes.
    async fn transition(&self, id: JobId, from: JobState, to: JobState, update: JobUpdate)
    -> Result<Job>;

    /// Queued background jobs with `run_at <= now`, oldest first.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Jobs in `state` (all states when `None`), newest first.
    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>>;

    /// Turn an inline job into a background job. An executing attempt is
    /// re-queued to run at `now`. Returns false if the job already reached a
    /// terminal state.
    async fn detach_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// After a restart: re-queue every job left `Executing`, and hand inline
    /// jobs still `Queued` (their caller is gone) to the background
    /// dispatcher. Recovered jobs are no longer inline.
    async fn requeue_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    async fn record_journal(&self, kind: JournalKind) -> Result<JournalEntry>;

    async fn journal_since(&self, since_seq: u64) -> Result<Vec<JournalEntry>>;
}
