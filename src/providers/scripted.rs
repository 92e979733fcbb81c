//! Deterministic providers for tests and local demos.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ActionProvider, DecisionProvider};
use crate::error::ToolError;
use crate::job::{JobId, JobState, Observation, Step, ToolInvocation, ToolName};

/// Replays a fixed list of steps. Once exhausted it repeats the fallback
/// step, or finishes the job if there is none.
#[derive(Default)]
pub struct ScriptedDecisions {
    script: Mutex<VecDeque<Result<Step, ToolError>>>,
    fallback: Option<Step>,
    calls: AtomicUsize,
}

impl ScriptedDecisions {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    /// Never finishes on its own: keeps requesting `step` forever.
    pub fn repeating(step: Step) -> Self {
        Self {
            fallback: Some(step),
            ..Default::default()
        }
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().push_back(Ok(step));
        self
    }

    pub fn then_fail(self, error: ToolError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Number of times the loop asked for a decision.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisions {
    async fn next_step(&self, _state: &JobState) -> Result<Step, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        match &self.fallback {
            // Fresh call id so every repetition is a distinct call.
            Some(Step::Invoke(invocation)) => Ok(Step::Invoke(ToolInvocation::new(
                invocation.tool,
                invocation.arguments.clone(),
            ))),
            Some(step) => Ok(step.clone()),
            None => Ok(Step::done("Script finished")),
        }
    }
}

/// Answers each tool from a queue of canned outcomes; succeeds with a
/// generic observation when a tool's queue is empty.
#[derive(Default)]
pub struct ScriptedActions {
    outcomes: Mutex<HashMap<ToolName, VecDeque<Result<Observation, ToolError>>>>,
    executed: Mutex<Vec<ToolInvocation>>,
    delay: Option<Duration>,
    stall_sessions: bool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ScriptedActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every execution sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Opening and closing a session never complete.
    pub fn stall_sessions(mut self) -> Self {
        self.stall_sessions = true;
        self
    }

    pub fn respond(self, tool: ToolName, observation: Observation) -> Self {
        self.outcomes
            .lock()
            .entry(tool)
            .or_default()
            .push_back(Ok(observation));
        self
    }

    pub fn fail(self, tool: ToolName, error: ToolError, times: usize) -> Self {
        {
            let mut outcomes = self.outcomes.lock();
            let queue = outcomes.entry(tool).or_default();
            for _ in 0..times {
                queue.push_back(Err(error.clone()));
            }
        }
        self
    }

    /// Every invocation that reached the provider, in order.
    pub fn executed(&self) -> Vec<ToolInvocation> {
        self.executed.lock().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionProvider for ScriptedActions {
    async fn open_session(&self, _job_id: JobId) -> Result<(), ToolError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.stall_sessions {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn execute(
        &self,
        _job_id: JobId,
        invocation: &ToolInvocation,
    ) -> Result<Observation, ToolError> {
        self.executed.lock().push(invocation.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .outcomes
            .lock()
            .get_mut(&invocation.tool)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(Observation::new(invocation.describe())))
    }

    async fn close_session(&self, _job_id: JobId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.stall_sessions {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_decisions_replay_then_finish() {
        let decisions = ScriptedDecisions::new([Step::invoke(ToolName::Analyze, json!({}))])
            .then_fail(ToolError::unavailable("503"));
        let state = JobState::default();

        assert!(matches!(decisions.next_step(&state).await, Ok(Step::Invoke(_))));
        assert!(decisions.next_step(&state).await.is_err());
        assert_eq!(
            decisions.next_step(&state).await.unwrap(),
            Step::done("Script finished")
        );
        assert_eq!(decisions.calls(), 3);
    }

    #[tokio::test]
    async fn test_repeating_uses_fresh_call_ids() {
        let decisions = ScriptedDecisions::repeating(Step::invoke(ToolName::Analyze, json!({})));
        let state = JobState::default();

        let (Ok(Step::Invoke(a)), Ok(Step::Invoke(b))) = (
            decisions.next_step(&state).await,
            decisions.next_step(&state).await,
        ) else {
            panic!("expected invocations");
        };
        assert_ne!(a.call_id, b.call_id);
    }

    #[tokio::test]
    async fn test_actions_queue_per_tool() {
        let actions = ScriptedActions::new()
            .fail(ToolName::Fill, ToolError::recoverable("stale element"), 1)
            .respond(ToolName::Analyze, Observation::new("found form"));
        let job = Uuid::new_v4();
        let fill = ToolInvocation::new(ToolName::Fill, json!({ "fields": {} }));

        assert!(actions.execute(job, &fill).await.is_err());
        assert!(actions.execute(job, &fill).await.is_ok());
        let analyzed = actions
            .execute(job, &ToolInvocation::new(ToolName::Analyze, json!({})))
            .await
            .unwrap();
        assert_eq!(analyzed.summary, "found form");
        assert_eq!(actions.executed().len(), 3);
    }
}
