//! Error taxonomy for the orchestration core.
//!
//! Adapter failures are values (`ToolError`) that the job loop classifies and
//! handles itself; `OrchestratorError` is what callers of the public API see.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

/// Errors returned synchronously by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("No pending interrupt for job {0}")]
    NoPendingInterrupt(JobId),

    #[error("Input does not match expected type: expected {expected}")]
    TypeMismatch { expected: String },

    #[error("An interrupt is already pending for job {0}")]
    AlreadyPending(JobId),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors from the job state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No checkpoint for job {0}")]
    NotFound(JobId),

    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Classification of an adapter failure, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient failure of the requested action; retried up to the cap.
    Recoverable,
    /// Retrying cannot help (bad target, unauthorized provider).
    NonRecoverable,
    /// The provider itself is down or overloaded; retried like `Recoverable`.
    ProviderUnavailable,
}

/// A failure reported by the action or decision provider.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolError {
    pub class: ErrorClass,
    pub message: String,
}

impl ToolError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Recoverable,
            message: message.into(),
        }
    }

    pub fn non_recoverable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::NonRecoverable,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::ProviderUnavailable,
            message: message.into(),
        }
    }

    /// Whether the orchestrator may try again.
    pub fn is_retryable(&self) -> bool {
        self.class != ErrorClass::NonRecoverable
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("Step limit exceeded ({0} steps)")]
    StepLimitExceeded(u32),

    #[error("Agent gave up: {0}")]
    GaveUp(String),

    #[error("Non-recoverable tool error: {0}")]
    NonRecoverable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
