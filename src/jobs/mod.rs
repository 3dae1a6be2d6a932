//! Job queue: at-least-once execution of named handlers with per-pool
//! concurrency limits and retry policies.
//!
//! State machine per job: `Queued -> Executing -> Finished | Queued (retry) |
//! Failed`, plus `Queued -> Cancelled` for jobs that have not started.
//! Failed jobs are kept for inspection. Retries of one job run strictly one
//! after another; nothing is promised about ordering across jobs.

pub mod policy;
pub mod registry;
pub mod store;
mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use crate::journal::{JournalEntry, JournalKind};
use crate::model::job::{Job, JobId, JobState, JobUpdate, NewJob};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

pub use policy::RetryPolicy;
pub use registry::{HandlerRegistry, HandlerSpec, JobContext, JobHandler, JobsConfig};
pub use store::JobStore;

/// Configuration for the background dispatcher.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Poll interval fallback when no enqueue notification arrives.
    pub poll_interval: Duration,
    /// Most due jobs claimed per dispatch round.
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 64,
        }
    }
}

/// Result of one execution attempt.
enum Attempt {
    Finished(Value),
    Retry(Duration),
    Failed(Error),
}

/// The job queue. Cheap to clone; clones share the store, registry and
/// dispatcher signals.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    wakeup: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
            wakeup: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Run `handler` as soon as a pool slot is free.
    pub async fn enqueue(&self, handler: &str, args: Vec<Value>) -> Result<JobId> {
        self.submit(NewJob::new(handler, args)).await
    }

    /// Run `handler` no earlier than `delay` from now.
    pub async fn schedule(&self, handler: &str, delay: Duration, args: Vec<Value>) -> Result<JobId> {
        self.submit(NewJob::new(handler, args).delay(delay)).await
    }

    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        let registration = self
            .registry
            .get(&new.handler)
            .ok_or_else(|| Error::UnknownHandler(new.handler.clone()))?;

        let now = self.clock.now();
        let job = Job {
            id: JobId::new(),
            pool: registration.pool.clone(),
            max_attempts: registration.policy.max_attempts(),
            handler: new.handler,
            args: new.args,
            state: JobState::Queued,
            attempts: 0,
            run_at: clock::after(now, new.delay),
            inline: new.inline,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        self.store.insert_job(&job).await?;
        self.journal(JournalKind::JobQueued {
            id: job.id,
            handler: job.handler.clone(),
            run_at: job.run_at,
        })
        .await;
        debug!(id = %job.id, handler = %job.handler, run_at = %job.run_at, inline = job.inline, "job queued");

        if !job.inline {
            self.wakeup.notify_one();
        }
        Ok(job.id)
    }

    /// Run `handler` on the caller's task and wait for its outcome, retries
    /// included, for at most `timeout`.
    ///
    /// Each attempt waits for a slot in the handler's pool, like background
    /// attempts do. Past the deadline the job is handed to the background
    /// dispatcher and the caller gets `Error::DeadlineExceeded`. The job is
    /// never abandoned.
    pub async fn do_sync(&self, handler: &str, args: Vec<Value>, timeout: Duration) -> Result<Value> {
        let id = self.submit(NewJob::new(handler, args).inline()).await?;

        match tokio::time::timeout(timeout, self.drive(id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let detached = self.store.detach_job(id, self.clock.now()).await?;
                if detached {
                    self.journal(JournalKind::JobDetached { id }).await;
                    self.wakeup.notify_one();
                }
                warn!(%id, handler, ?timeout, "synchronous job exceeded its deadline");
                Err(Error::DeadlineExceeded(timeout, id.to_string()))
            }
        }
    }

    /// Attempt an inline job until it settles.
    async fn drive(&self, id: JobId) -> Result<Value> {
        loop {
            let job = self.store.get_job(id).await?;
            match job.state {
                JobState::Finished => return Ok(job.result.unwrap_or(Value::Null)),
                JobState::Failed => {
                    return Err(Error::Other(job.last_error.unwrap_or_else(|| "job failed".into())));
                }
                JobState::Cancelled => return Err(Error::Other(format!("job {id} was cancelled"))),
                JobState::Executing => {
                    return Err(Error::InvalidTransition {
                        from: JobState::Executing.to_string(),
                        to: JobState::Executing.to_string(),
                    });
                }
                JobState::Queued => {}
            }

            // Inline attempts share the pool's slots with background ones;
            // the slot is held for the attempt only, not the backoff.
            let permit = match self.registry.permits(&job.pool) {
                Some(permits) => Some(
                    permits
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Other(format!("job pool {} is closed", job.pool)))?,
                ),
                None => None,
            };
            let attempt = self.execute(job).await;
            if permit.is_some() {
                drop(permit);
                self.wakeup.notify_one();
            }

            match attempt? {
                Attempt::Finished(value) => return Ok(value),
                Attempt::Failed(e) => return Err(e),
                Attempt::Retry(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Claim a queued job and run one attempt.
    async fn execute(&self, job: Job) -> Result<Attempt> {
        let id = job.id;
        let job = self
            .store
            .transition(id, JobState::Queued, JobState::Executing, JobUpdate::begin_attempt())
            .await?;
        let span = start_job_span(&job.handler, id, job.attempts);
        record_state_transition(&span, "queued", "executing");
        self.journal(JournalKind::JobStarted {
            id,
            attempt: job.attempts,
        })
        .await;

        let ctx = JobContext {
            job_id: id,
            handler: job.handler.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
        };

        let Some(registration) = self.registry.get(&job.handler).cloned() else {
            let err = Error::UnknownHandler(job.handler.clone());
            record_state_transition(&span, "executing", "failed");
            self.settle_failed(&job, &err).await?;
            return Ok(Attempt::Failed(err));
        };

        let started = Instant::now();
        let outcome = registration
            .handler
            .run(&ctx, &job.args)
            .instrument(span.clone())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let handler_label = KeyValue::new("handler", job.handler.clone());
        metrics::job_duration_ms().record(duration_ms as f64, std::slice::from_ref(&handler_label));

        match outcome {
            Ok(value) => {
                self.store
                    .transition(id, JobState::Executing, JobState::Finished, JobUpdate::finished(value.clone()))
                    .await?;
                record_state_transition(&span, "executing", "finished");
                self.journal(JournalKind::JobFinished { id, duration_ms }).await;
                metrics::jobs_completed().add(1, &[handler_label, KeyValue::new("outcome", "finished")]);
                Ok(Attempt::Finished(value))
            }
            Err(e) if e.is_retryable() && job.attempts < job.max_attempts => {
                let delay = registration.policy.delay_after(job.attempts);
                let run_at = clock::after(self.clock.now(), delay);
                self.store
                    .transition(
                        id,
                        JobState::Executing,
                        JobState::Queued,
                        JobUpdate::retry_at(run_at, e.to_string()),
                    )
                    .await?;
                record_state_transition(&span, "executing", "queued");
                warn!(%id, handler = %job.handler, attempt = job.attempts, ?delay, error = %e, "job attempt failed, retrying");
                self.journal(JournalKind::JobRetryScheduled {
                    id,
                    attempt: job.attempts,
                    delay_ms: delay.as_millis() as u64,
                    error: e.to_string(),
                })
                .await;
                metrics::jobs_completed().add(1, &[handler_label, KeyValue::new("outcome", "retried")]);
                Ok(Attempt::Retry(delay))
            }
            Err(e) => {
                record_state_transition(&span, "executing", "failed");
                self.settle_failed(&job, &e).await?;
                registration
                    .handler
                    .on_failure(&ctx, &job.args, &e)
                    .instrument(span)
                    .await;
                Ok(Attempt::Failed(e))
            }
        }
    }

    async fn settle_failed(&self, job: &Job, err: &Error) -> Result<()> {
        self.store
            .transition(job.id, JobState::Executing, JobState::Failed, JobUpdate::failed(err.to_string()))
            .await?;
        error!(id = %job.id, handler = %job.handler, attempts = job.attempts, error = %err, "job failed");
        self.journal(JournalKind::JobFailed {
            id: job.id,
            attempts: job.attempts,
            error: err.to_string(),
        })
        .await;
        metrics::jobs_completed().add(
            1,
            &[
                KeyValue::new("handler", job.handler.clone()),
                KeyValue::new("outcome", "failed"),
            ],
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Management
    // -----------------------------------------------------------------------

    /// Remove a job that has not started yet. Executing and settled jobs are
    /// left alone and the call fails with `Error::InvalidTransition`.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let job = self
            .store
            .transition(id, JobState::Queued, JobState::Cancelled, JobUpdate::default())
            .await?;
        self.journal(JournalKind::JobCancelled { id }).await;
        info!(%id, handler = %job.handler, "job cancelled");
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get_job(id).await
    }

    pub async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        self.store.list_jobs(state, limit).await
    }

    /// Jobs that ran out of attempts or hit a terminal error, newest first.
    pub async fn failed(&self, limit: usize) -> Result<Vec<Job>> {
        self.store.list_jobs(Some(JobState::Failed), limit).await
    }

    /// Re-queue the jobs a crashed process left behind: attempts that were
    /// executing, and synchronous jobs whose caller died between retries.
    /// All of them continue as background jobs.
    ///
    /// Call at startup, before serving: a synchronous job of a live caller
    /// would be taken over as well.
    pub async fn recover(&self) -> Result<Vec<JobId>> {
        let ids = self.store.requeue_interrupted(self.clock.now()).await?;
        for id in &ids {
            self.journal(JournalKind::JobRecovered { id: *id }).await;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "recovered interrupted jobs");
            self.wakeup.notify_one();
        }
        Ok(ids)
    }

    pub async fn journal_since(&self, seq: u64) -> Result<Vec<JournalEntry>> {
        self.store.journal_since(seq).await
    }

    /// The journal is diagnostic; a failed append never fails the job.
    async fn journal(&self, kind: JournalKind) {
        if let Err(e) = self.store.record_journal(kind).await {
            warn!(error = %e, "failed to append job journal entry");
        }
    }
}

// ---------------------------------------------------------------------------
// Argument decoding
// ---------------------------------------------------------------------------

/// Decode positional argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| Error::MalformedPayload(format!("missing job argument {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::MalformedPayload(format!("job argument {index}: {e}")))
}
