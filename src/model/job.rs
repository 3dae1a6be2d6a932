//! Job model.
//!
//! A job is a named, retryable unit of deferred work. It carries its handler
//! name, positional JSON arguments, the time it may next run, and its
//! lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Registered handler name (e.g. "post_comment").
    pub handler: String,

    /// Worker pool the handler runs in. Caps concurrency per task type.
    pub pool: String,

    /// Positional arguments. Opaque to the queue.
    pub args: Vec<serde_json::Value>,

    pub state: JobState,

    /// Execution attempts so far.
    pub attempts: u32,

    /// Attempt budget, fixed from the handler's policy at enqueue time.
    pub max_attempts: u32,

    /// Earliest time the next attempt may start.
    pub run_at: DateTime<Utc>,

    /// Set for `do_sync` jobs; the background dispatcher skips them.
    pub inline: bool,

    pub last_error: Option<String>,

    /// Handler output of the successful attempt.
    pub result: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn retries_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `run_at` and a free pool slot.
    Queued,
    /// An attempt is in flight.
    Executing,
    /// Done successfully. Terminal.
    Finished,
    /// Retries exhausted or terminal error. Terminal, kept for inspection.
    Failed,
    /// Removed before it started. Terminal.
    Cancelled,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Executing)
                | (Queued, Cancelled)
                | (Executing, Finished)
                | (Executing, Queued)   // retry, or crash recovery
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Executing => "executing",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "executing" => Ok(JobState::Executing),
            "finished" => Ok(JobState::Finished),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(crate::error::Error::Other(format!("unknown job state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition payload
// ---------------------------------------------------------------------------

/// Column changes applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// Count this transition as the start of a new attempt.
    pub begin_attempt: bool,
    pub run_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn begin_attempt() -> Self {
        Self {
            begin_attempt: true,
            ..Self::default()
        }
    }

    pub fn retry_at(run_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            run_at: Some(run_at),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn finished(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The queue fills in pool and attempt budget from the registry.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) handler: String,
    pub(crate) args: Vec<serde_json::Value>,
    pub(crate) delay: std::time::Duration,
    pub(crate) inline: bool,
}

impl NewJob {
    pub fn new(handler: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            handler: handler.into(),
            args,
            delay: std::time::Duration::ZERO,
            inline: false,
        }
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn inline(mut self) -> Self {
        self.inline = true;
        self
    }
}
