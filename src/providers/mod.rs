//! The two external capabilities the job loop depends on.
//!
//! The loop is generic over both: production wires up [`HttpActionProvider`]
//! and [`LlmDecisionProvider`], tests use the scripted variants.

mod http;
mod llm;
mod scripted;

pub use http::HttpActionProvider;
pub use llm::LlmDecisionProvider;
pub use scripted::{ScriptedActions, ScriptedDecisions};

use async_trait::async_trait;

use crate::error::ToolError;
use crate::job::{JobId, JobState, Observation, Step, ToolInvocation};

/// Performs tool calls against a remote browser.
#[async_trait]
pub trait ActionProvider: Send + Sync {
    /// Called once when a job starts running. Bounded by the action timeout.
    async fn open_session(&self, _job_id: JobId) -> Result<(), ToolError> {
        Ok(())
    }

    /// Run one invocation. May take arbitrarily long; the caller bounds it.
    async fn execute(
        &self,
        job_id: JobId,
        invocation: &ToolInvocation,
    ) -> Result<Observation, ToolError>;

    /// Called once when a job reaches a terminal status. Bounded by the action timeout.
    async fn close_session(&self, _job_id: JobId) {}
}

/// Chooses the next step from the accumulated job state.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn next_step(&self, state: &JobState) -> Result<Step, ToolError>;
}
