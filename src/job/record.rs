//! The job record and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Opaque, unique job identifier.
pub type JobId = Uuid;

/// Lifecycle status of a job.
///
/// `queued → running ⇄ awaiting_input → {completed | failed | cancelled}`.
/// A queued job may also be cancelled (or failed) before it ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::{AwaitingInput, Cancelled, Completed, Failed, Queued, Running};

        match (self, next) {
            (Queued, Running | Cancelled | Failed) => true,
            (Running, AwaitingInput | Completed | Failed | Cancelled) => true,
            (AwaitingInput, Running | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::AwaitingInput => "awaiting_input",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "awaiting_input" => JobStatus::AwaitingInput,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scrape task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: String,
    /// Observer/session key of the real-time channel that submitted the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub step_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Human-readable reason for `failed` / `cancelled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Job {
    pub fn new(target: String, session_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target,
            session_id,
            status: JobStatus::Queued,
            step_count: 0,
            created_at: now,
            updated_at: now,
            failure: None,
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` (and leaves the job untouched) otherwise; terminal
    /// jobs never change.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Check that a submitted target is an absolute http(s) URL with a host.
pub fn validate_target(target: &str) -> OrchestratorResult<Url> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::InvalidTarget("URL is empty".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| OrchestratorError::InvalidTarget(format!("{}: {}", trimmed, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(OrchestratorError::InvalidTarget(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(OrchestratorError::InvalidTarget(format!(
            "{} has no host",
            trimmed
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::AwaitingInput,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_running_and_awaiting_alternate() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::AwaitingInput));
        assert!(JobStatus::AwaitingInput.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::AwaitingInput.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::AwaitingInput));
    }

    #[test]
    fn test_transition_refuses_to_leave_terminal() {
        let mut job = Job::new("https://example.com".into(), None);
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Completed));
        assert!(!job.transition(JobStatus::Cancelled));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [JobStatus::Queued, JobStatus::AwaitingInput, JobStatus::Cancelled] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("pending"), None);
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("https://example.com").is_ok());
        assert!(validate_target("  http://example.com/login ").is_ok());
        assert!(matches!(
            validate_target(""),
            Err(OrchestratorError::InvalidTarget(_))
        ));
        assert!(matches!(
            validate_target("example.com"),
            Err(OrchestratorError::InvalidTarget(_))
        ));
        assert!(matches!(
            validate_target("ftp://example.com"),
            Err(OrchestratorError::InvalidTarget(_))
        ));
    }
}
