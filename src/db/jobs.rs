//! `JobStore` on Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::jobs::store::JobStore;
use crate::journal::{JournalEntry, JournalKind};
use crate::model::job::{Job, JobId, JobState, JobUpdate};

const JOB_COLUMNS: &str = "id, handler, pool, args, state, attempts, max_attempts, run_at, inline, \
                           last_error, result, created_at, updated_at, finished_at";

#[async_trait]
impl JobStore for Db {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (
                id, handler, pool, args, state, attempts, max_attempts, run_at, inline,
                last_error, result, created_at, updated_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(job.id.0)
        .bind(&job.handler)
        .bind(&job.pool)
        .bind(serde_json::to_value(&job.args)?)
        .bind(job.state.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.run_at)
        .bind(job.inline)
        .bind(&job.last_error)
        .bind(&job.result)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        let mut conn = self.pool().acquire().await?;
        get_job_on(&mut conn, id).await
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        update: JobUpdate,
    ) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        // Optimistic: only applies if the job is still in `from`.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET
                state = $1,
                updated_at = $2,
                attempts = attempts + $3,
                run_at = COALESCE($4, run_at),
                last_error = COALESCE($5, last_error),
                result = COALESCE($6, result),
                finished_at = CASE WHEN $7 THEN $2 ELSE finished_at END
             WHERE id = $8 AND state = $9
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(self.now())
        .bind(i32::from(update.begin_attempt))
        .bind(update.run_at)
        .bind(update.error)
        .bind(update.result)
        .bind(to.is_terminal())
        .bind(id.0)
        .bind(from.as_str())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => row.try_into_job(),
            None => {
                let mut conn = self.pool().acquire().await?;
                let current = get_job_on(&mut conn, id).await?;
                Err(Error::InvalidTransition {
                    from: current.state.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE state = 'queued' AND NOT inline AND run_at <= $1
             ORDER BY run_at ASC, created_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = $1
                     ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(state.as_str())
                .bind(limit as i64)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1"
                ))
                .bind(limit as i64)
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn detach_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let detached = sqlx::query(
            "UPDATE jobs SET inline = FALSE, state = 'queued', run_at = $2, updated_at = $2
             WHERE id = $1 AND state IN ('queued', 'executing')",
        )
        .bind(id.0)
        .bind(now)
        .execute(self.pool())
        .await?;
        if detached.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish "already terminal" from "unknown id".
        self.get_job(id).await.map(|_| false)
    }

    async fn requeue_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE jobs SET
                 run_at = CASE WHEN state = 'executing' THEN $1 ELSE run_at END,
                 state = 'queued', inline = FALSE, updated_at = $1
             WHERE state = 'executing' OR (state = 'queued' AND inline)
             RETURNING id",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().map(|(id,)| JobId(id)).collect())
    }

    async fn record_journal(&self, kind: JournalKind) -> Result<JournalEntry> {
        let now = self.now();
        let raw = serde_json::to_string(&kind)?;
        let (seq,): (i64,) =
            sqlx::query_as("INSERT INTO job_journal (timestamp, kind) VALUES ($1, $2) RETURNING seq")
                .bind(now)
                .bind(raw)
                .fetch_one(self.pool())
                .await?;
        Ok(JournalEntry {
            seq: seq as u64,
            timestamp: now,
            kind,
        })
    }

    async fn journal_since(&self, since_seq: u64) -> Result<Vec<JournalEntry>> {
        let rows: Vec<(i64, DateTime<Utc>, String)> = sqlx::query_as(
            "SELECT seq, timestamp, kind FROM job_journal WHERE seq > $1 ORDER BY seq ASC",
        )
        .bind(since_seq as i64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(seq, timestamp, raw)| JournalEntry {
                seq: seq as u64,
                timestamp,
                kind: JournalKind::decode(&raw),
            })
            .collect())
    }
}

async fn get_job_on(conn: &mut PgConnection, id: JobId) -> Result<Job> {
    let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(id.0)
        .fetch_optional(conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
        .try_into_job()
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    handler: String,
    pool: String,
    args: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    inline: bool,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            handler: self.handler,
            pool: self.pool,
            args: serde_json::from_value(self.args)
                .map_err(|e| Error::Other(format!("parse error: {e}")))?,
            state: self.state.parse()?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            run_at: self.run_at,
            inline: self.inline,
            last_error: self.last_error,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}
