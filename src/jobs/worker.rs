//! Background dispatcher: claims due jobs and runs them on their pools.

use tracing::{debug, error, info, warn};

use super::JobQueue;
use crate::error::{Error, Result};
use crate::model::job::Job;

impl JobQueue {
    /// Signal the dispatcher to stop. Attempts already running finish on
    /// their own tasks.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the dispatcher loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            handlers = ?self.registry.names(),
            "job dispatcher started"
        );

        loop {
            if let Err(e) = self.dispatch_due().await {
                error!("dispatch error: {e}");
            }

            // Wait for: shutdown, an enqueue/slot-free signal, or poll timeout
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("job dispatcher shutting down");
                    return Ok(());
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Spawn every due job whose pool has a free slot. Returns how many were spawned.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let due = self
            .store
            .due_jobs(self.clock.now(), self.config.batch_size)
            .await?;

        let mut spawned = 0;
        for job in due {
            let Some(permits) = self.registry.permits(&job.pool) else {
                // Handler no longer registered: the attempt fails it with a reason.
                self.run_attempt(job).await;
                continue;
            };
            let Ok(permit) = permits.try_acquire_owned() else {
                debug!(pool = %job.pool, id = %job.id, "pool saturated, job stays queued");
                continue;
            };

            let queue = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                queue.run_attempt(job).await;
                // A slot just freed up.
                queue.wakeup.notify_one();
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Run due jobs on the current task, one at a time, until none are due.
    /// Pool limits do not apply. Returns the number of attempts made.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut attempts = 0;
        loop {
            let due = self
                .store
                .due_jobs(self.clock.now(), self.config.batch_size)
                .await?;
            if due.is_empty() {
                return Ok(attempts);
            }
            for job in due {
                self.run_attempt(job).await;
                attempts += 1;
            }
        }
    }

    async fn run_attempt(&self, job: Job) {
        let id = job.id;
        match self.execute(job).await {
            Ok(_) => {}
            // Another dispatcher (or a cancel) got there first.
            Err(Error::InvalidTransition { from, to }) => {
                debug!(%id, %from, %to, "job claimed elsewhere");
            }
            Err(e) => warn!(%id, error = %e, "job attempt could not be recorded"),
        }
    }
}
