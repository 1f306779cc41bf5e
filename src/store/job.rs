use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Pending` and `Failed` jobs become claimable once their `run_at` has
/// passed; `Completed` and `Dead` are terminal (`Dead` until an
/// administrative retry resets it to `Pending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!(
                "unknown job state \"{}\" (expected pending, processing, completed, failed or dead)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Parameters for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Client-assigned unique id
    pub id: String,
    /// Shell command to execute
    pub command: String,
    /// Higher dispatches first
    pub priority: i64,
    /// Delay before the job becomes eligible (seconds)
    pub delay_secs: i64,
    /// Attempt ceiling; falls back to the `max_retries` config key
    pub max_retries: Option<i64>,
}

/// Outcome of an execution attempt, written back through
/// [`JobStore::resolve`](super::JobStore::resolve).
///
/// Resolving always releases the lock; `run_at` is only set when
/// scheduling a retry.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub state: JobState,
    pub attempts: i64,
    pub stdout: String,
    pub stderr: String,
    pub run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn state_display_round_trips() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(JobState::from_str(&state.to_string()), Ok(state));
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!(JobState::from_str("running").is_err());
    }
}
