//! `JobStore` on SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{Storage, from_millis, millis};
use crate::error::{Error, Result};
use crate::jobs::store::JobStore;
use crate::journal::{JournalEntry, JournalKind};
use crate::model::job::{Job, JobId, JobState, JobUpdate};

const JOB_COLUMNS: &str = "id, handler, pool, args, state, attempts, max_attempts, run_at, inline, \
                           last_error, result, created_at, updated_at, finished_at";

#[async_trait]
impl JobStore for Storage {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let args = serde_json::to_string(&job.args)?;
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (
                    id, handler, pool, args, state, attempts, max_attempts, run_at, inline,
                    last_error, result, created_at, updated_at, finished_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    job.id.to_string(),
                    job.handler,
                    job.pool,
                    args,
                    job.state.as_str(),
                    job.attempts,
                    job.max_attempts,
                    millis(job.run_at),
                    job.inline,
                    job.last_error,
                    result,
                    millis(job.created_at),
                    millis(job.updated_at),
                    job.finished_at.map(millis),
                ],
            )?;
            Ok(())
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        self.with_conn(|conn| get_job_on(conn, id))
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
        let now = millis(self.now());
        let result = update.result.as_ref().map(serde_json::to_string).transpose()?;

        self.with_transaction(|tx| {
            let changed = tx.execute(
                "UPDATE jobs SET
                    state = ?1,
                    updated_at = ?2,
                    attempts = attempts + ?3,
                    run_at = COALESCE(?4, run_at),
                    last_error = COALESCE(?5, last_error),
                    result = COALESCE(?6, result),
                    finished_at = CASE WHEN ?7 THEN ?2 ELSE finished_at END
                 WHERE id = ?8 AND state = ?9",
                params![
                    to.as_str(),
                    now,
                    u32::from(update.begin_attempt),
                    update.run_at.map(millis),
                    update.error,
                    result,
                    to.is_terminal(),
                    id.to_string(),
                    from.as_str(),
                ],
            )?;

            if changed == 0 {
                // Either the job is unknown (NotFound) or someone moved it first.
                let current = get_job_on(tx, id)?;
                return Err(Error::InvalidTransition {
                    from: current.state.to_string(),
                    to: to.to_string(),
                });
            }
            get_job_on(tx, id)
        })
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            query_jobs_on(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE state = 'queued' AND inline = 0 AND run_at <= ?1
                     ORDER BY run_at ASC, created_at ASC LIMIT ?2"
                ),
                params![millis(now), limit as i64],
            )
        })
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        self.with_conn(|conn| match state {
            Some(state) => query_jobs_on(
                conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![state.as_str(), limit as i64],
            ),
            None => query_jobs_on(
                conn,
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"),
                params![limit as i64],
            ),
        })
    }

    async fn detach_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let now = millis(now);
        self.with_transaction(|tx| {
            let job = get_job_on(tx, id)?;
            if job.state.is_terminal() {
                return Ok(false);
            }
            // An executing inline attempt was abandoned by its caller; run it again.
            tx.execute(
                "UPDATE jobs SET inline = 0, state = 'queued', run_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND state IN ('queued', 'executing')",
                params![id.to_string(), now],
            )?;
            Ok(true)
        })
    }

    async fn requeue_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let now = millis(now);
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE state = 'executing' OR (state = 'queued' AND inline = 1)",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            // Executing attempts run again now; inline jobs waiting out a
            // backoff keep their run_at.
            let mut recovered = Vec::with_capacity(ids.len());
            for raw in ids {
                tx.execute(
                    "UPDATE jobs SET
                         run_at = CASE WHEN state = 'executing' THEN ?2 ELSE run_at END,
                         state = 'queued', inline = 0, updated_at = ?2
                     WHERE id = ?1 AND (state = 'executing' OR (state = 'queued' AND inline = 1))",
                    params![raw, now],
                )?;
                recovered.push(parse_job_id(&raw)?);
            }
            Ok(recovered)
        })
    }

    async fn record_journal(&self, kind: JournalKind) -> Result<JournalEntry> {
        let now = self.now();
        let raw = serde_json::to_string(&kind)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO journal (timestamp, kind) VALUES (?1, ?2)",
                params![millis(now), raw],
            )?;
            let seq = conn.last_insert_rowid();
            Ok(JournalEntry {
                seq: seq as u64,
                timestamp: now,
                kind,
            })
        })
    }

    async fn journal_since(&self, since_seq: u64) -> Result<Vec<JournalEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT seq, timestamp, kind FROM journal WHERE seq > ?1 ORDER BY seq ASC")?;
            let entries = stmt
                .query_map(params![since_seq as i64], |row| {
                    let raw: String = row.get(2)?;
                    Ok(JournalEntry {
                        seq: row.get::<_, i64>(0)? as u64,
                        timestamp: from_millis(row.get(1)?)?,
                        kind: JournalKind::decode(&raw),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}

// ---------------------------------------------------------------------------
// Inner functions. They take &Connection so a Transaction (deref to
// Connection) works too.
// ---------------------------------------------------------------------------

fn get_job_on(conn: &Connection, id: JobId) -> Result<Job> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id.to_string()],
        |row| Ok(row_to_job(row)),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("job {id}")))?
    .map_err(|e| Error::Other(format!("parse error: {e}")))
}

fn query_jobs_on(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_job(row)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut jobs = Vec::with_capacity(rows.len());
    for job in rows {
        jobs.push(job.map_err(|e| Error::Other(format!("parse error: {e}")))?);
    }
    Ok(jobs)
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|e: uuid::Error| Error::Other(format!("invalid job id {raw}: {e}")))
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row) -> std::result::Result<Job, String> {
    let id: String = row.get(0).map_err(|e| e.to_string())?;
    let args: String = row.get(3).map_err(|e| e.to_string())?;
    let state: String = row.get(4).map_err(|e| e.to_string())?;
    let result: Option<String> = row.get(10).map_err(|e| e.to_string())?;
    let time = |idx: usize| -> std::result::Result<DateTime<Utc>, String> {
        let ms: i64 = row.get(idx).map_err(|e| e.to_string())?;
        from_millis(ms).map_err(|e| e.to_string())
    };
    let finished_at: Option<i64> = row.get(13).map_err(|e| e.to_string())?;

    Ok(Job {
        id: id.parse().map_err(|e: uuid::Error| e.to_string())?,
        handler: row.get(1).map_err(|e| e.to_string())?,
        pool: row.get(2).map_err(|e| e.to_string())?,
        args: serde_json::from_str(&args).map_err(|e| e.to_string())?,
        state: state.parse().map_err(|e: Error| e.to_string())?,
        attempts: row.get(5).map_err(|e| e.to_string())?,
        max_attempts: row.get(6).map_err(|e| e.to_string())?,
        run_at: time(7)?,
        inline: row.get(8).map_err(|e| e.to_string())?,
        last_error: row.get(9).map_err(|e| e.to_string())?,
        result: result
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| e.to_string())?,
        created_at: time(11)?,
        updated_at: time(12)?,
        finished_at: finished_at
            .map(from_millis)
            .transpose()
            .map_err(|e| e.to_string())?,
    })
}
