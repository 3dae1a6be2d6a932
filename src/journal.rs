//! Structured journal of job lifecycle transitions.
//!
//! Every state change the job queue makes is appended here with a monotonic
//! sequence number, so operators can reconstruct why a job ended up failed
//! without relying on log retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::job::JobId;

/// One journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: JournalKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalKind {
    JobQueued {
        id: JobId,
        handler: String,
        run_at: DateTime<Utc>,
    },
    JobStarted {
        id: JobId,
        attempt: u32,
    },
    JobFinished {
        id: JobId,
        duration_ms: u64,
    },
    JobRetryScheduled {
        id: JobId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobFailed {
        id: JobId,
        attempts: u32,
        error: String,
    },
    JobCancelled {
        id: JobId,
    },
    /// Re-queued after a restart found it executing.
    JobRecovered {
        id: JobId,
    },
    /// A synchronous caller gave up waiting; the job moved to the background.
    JobDetached {
        id: JobId,
    },
    /// Stored text that no longer decodes.
    #[serde(skip)]
    Unknown {
        raw: String,
    },
}

impl JournalKind {
    /// Decode a stored entry, keeping undecodable rows visible instead of failing the read.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| JournalKind::Unknown {
            raw: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_entries_decode_and_garbage_stays_visible() {
        let id = JobId::new();
        let raw = serde_json::to_string(&JournalKind::JobCancelled { id }).unwrap();
        assert_eq!(JournalKind::decode(&raw), JournalKind::JobCancelled { id });

        assert_eq!(
            JournalKind::decode(r#"{"type":"job_teleported"}"#),
            JournalKind::Unknown {
                raw: r#"{"type":"job_teleported"}"#.to_string()
            }
        );
    }
}
