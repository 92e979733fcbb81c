//! The per-job reason/act/observe loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OwnedSemaphorePermit;

use super::{JobHandle, Shared};
use crate::archive::JobRecord;
use crate::error::{FailureReason, ToolError};
use crate::events::EventKind;
use crate::interrupt::InterruptOutcome;
use crate::job::{
    InterruptRequest, JobId, JobState, JobStatus, Observation, Step, TerminalDecision,
    ToolInvocation, ToolName,
};
use crate::retry::{self, RetryDecision};
use crate::store::Checkpoint;

/// Retry key for decision-provider failures.
const DECIDE_KEY: &str = "decide";

/// Why the loop stopped.
#[derive(Debug)]
enum Exit {
    Completed,
    Failed(FailureReason),
    Cancelled,
}

/// `Err` stops the loop.
type Flow<T = ()> = Result<T, Exit>;

/// What to do after a failure that did not end the job.
enum AfterFailure {
    Retry,
    Escalated,
}

pub(super) struct Worker {
    shared: Arc<Shared>,
    handle: Arc<JobHandle>,
    id: JobId,
    state: JobState,
    in_flight: Option<ToolInvocation>,
}

impl Worker {
    pub(super) fn new(shared: Arc<Shared>, handle: Arc<JobHandle>, state: JobState) -> Self {
        let id = handle.live.lock().job.id;
        Self {
            shared,
            handle,
            id,
            state,
            in_flight: None,
        }
    }

    pub(super) async fn run(mut self) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.shared.permits).acquire_owned() => permit.ok(),
            _ = self.handle.cancel.cancelled() => None,
        };

        let exit = match permit {
            Some(_) => match self.start().await {
                Ok(()) => self.drive().await,
                Err(exit) => exit,
            },
            None => Exit::Cancelled,
        };
        self.finish(exit, permit).await;
    }

    async fn start(&mut self) -> Flow {
        self.check_cancelled()?;
        if self.handle.status() == JobStatus::AwaitingInput {
            // Re-opened by the loop from the checkpointed request.
            tracing::info!(job_id = %self.id, "Job resumed awaiting human input");
        } else {
            self.set_status(JobStatus::Running)?;
            tracing::info!(job_id = %self.id, target = %self.state.target, "Job started");
        }

        let timeout = self.shared.config.action_timeout;
        let open = self.shared.actions.open_session(self.id);
        if let Err(error) = self.bounded(open, timeout, "open_session").await? {
            if !error.is_retryable() {
                return Err(Exit::Failed(FailureReason::NonRecoverable(error.message)));
            }
            tracing::warn!(job_id = %self.id, error = %error, "Failed to open browser session; continuing");
        }
        Ok(())
    }

    async fn drive(&mut self) -> Exit {
        loop {
            if let Err(exit) = self.iteration().await {
                return exit;
            }
        }
    }

    async fn iteration(&mut self) -> Flow {
        self.check_cancelled()?;

        if let Some(request) = self.state.pending_interrupt.clone() {
            return self.await_human(request).await;
        }

        let step = match self.decide().await? {
            Ok(step) => step,
            Err(error) => {
                self.begin_step()?;
                return self.decision_failed(error).await;
            }
        };
        self.state.reset_retry(DECIDE_KEY);

        match step {
            Step::Finish(TerminalDecision::Done { summary }) => {
                tracing::info!(job_id = %self.id, summary = %summary, "Decision provider finished the job");
                self.state.record_note(format!("Done: {}", summary));
                Err(Exit::Completed)
            }
            Step::Finish(TerminalDecision::GiveUp { reason }) => {
                Err(Exit::Failed(FailureReason::GaveUp(reason)))
            }
            Step::Invoke(invocation) if invocation.tool == ToolName::RequestHumanInput => {
                self.begin_step()?;
                self.state.record_action(&invocation);
                match InterruptRequest::from_invocation(&invocation) {
                    Ok(request) => self.await_human(request).await,
                    Err(error) => {
                        // Malformed request: the next decision sees the failure.
                        self.tool_failed(&invocation, error).await.map(|_| ())
                    }
                }
            }
            Step::Invoke(invocation) => {
                self.begin_step()?;
                self.state.record_action(&invocation);
                self.execute(invocation).await
            }
        }
    }

    /// Run an action, retrying it in place until it succeeds, escalates or fails.
    async fn execute(&mut self, invocation: ToolInvocation) -> Flow {
        let mut attempt_started = true;
        loop {
            if !attempt_started {
                self.begin_step()?;
            }
            attempt_started = false;

            tracing::debug!(
                job_id = %self.id,
                tool = %invocation.tool,
                call_id = %invocation.call_id,
                step = self.state.step_count,
                "Executing action"
            );
            self.in_flight = Some(invocation.clone());
            self.checkpoint().await?;

            let result = self.call_action(&invocation).await?;
            self.in_flight = None;

            match result {
                Ok(observation) => return self.observed(&invocation, observation).await,
                Err(error) => match self.tool_failed(&invocation, error).await? {
                    AfterFailure::Retry => continue,
                    AfterFailure::Escalated => return Ok(()),
                },
            }
        }
    }

    async fn observed(&mut self, invocation: &ToolInvocation, observation: Observation) -> Flow {
        self.state.reset_retry(invocation.tool.as_str());
        self.state.record_observation(&invocation.call_id, observation);
        self.sync_progress();
        self.checkpoint().await?;
        self.publish(EventKind::Progress {
            action: invocation.describe(),
            partial_result: self.state.partial_result.clone(),
        })
    }

    async fn tool_failed(
        &mut self,
        invocation: &ToolInvocation,
        error: ToolError,
    ) -> Flow<AfterFailure> {
        let key = invocation.tool.as_str();
        let attempts = self.state.bump_retry(key);
        self.state
            .record_failure(Some(&invocation.call_id), &error, attempts);
        self.checkpoint().await?;

        match retry::decide(error.class, attempts, self.shared.config.max_tool_retries) {
            RetryDecision::Retry => {
                tracing::warn!(job_id = %self.id, tool = key, attempt = attempts, error = %error, "Action failed; retrying");
                Ok(AfterFailure::Retry)
            }
            RetryDecision::EscalateToHuman => {
                tracing::warn!(job_id = %self.id, tool = key, attempt = attempts, error = %error, "Retries exhausted; escalating to a human");
                self.state.reset_retry(key);
                let request = InterruptRequest::escalation(&invocation.call_id, key, attempts, &error);
                self.await_human(request).await?;
                Ok(AfterFailure::Escalated)
            }
            RetryDecision::Fail => Err(Exit::Failed(FailureReason::NonRecoverable(error.message))),
        }
    }

    async fn decision_failed(&mut self, error: ToolError) -> Flow {
        let attempts = self.state.bump_retry(DECIDE_KEY);
        self.state.record_failure(None, &error, attempts);
        self.checkpoint().await?;

        match retry::decide(error.class, attempts, self.shared.config.max_tool_retries) {
            RetryDecision::Retry => {
                tracing::warn!(job_id = %self.id, attempt = attempts, error = %error, "Decision failed; retrying");
                Ok(())
            }
            RetryDecision::EscalateToHuman => {
                tracing::warn!(job_id = %self.id, attempt = attempts, error = %error, "Decision provider keeps failing; escalating to a human");
                self.state.reset_retry(DECIDE_KEY);
                let call_id = format!("{}_{}", DECIDE_KEY, self.state.step_count);
                let request =
                    InterruptRequest::escalation(&call_id, "decision provider", attempts, &error);
                self.await_human(request).await
            }
            RetryDecision::Fail => Err(Exit::Failed(FailureReason::NonRecoverable(error.message))),
        }
    }

    /// Suspend until the human answers or the job is cancelled.
    async fn await_human(&mut self, request: InterruptRequest) -> Flow {
        let waiter = self
            .handle
            .interrupt
            .open(request.clone())
            .map_err(|e| Exit::Failed(FailureReason::Internal(e.to_string())))?;

        self.state.pending_interrupt = Some(request.clone());
        self.transition(
            JobStatus::AwaitingInput,
            Some(EventKind::Interrupt {
                prompt: request.prompt.clone(),
                input_type: request.input_type.clone(),
                context: request.context.clone(),
            }),
        )?;
        self.checkpoint().await?;
        tracing::info!(job_id = %self.id, call_id = %request.call_id, "Waiting for human input");

        let outcome = tokio::select! {
            outcome = waiter.wait() => outcome,
            _ = self.handle.cancel.cancelled() => InterruptOutcome::Cancelled,
        };
        let value = match outcome {
            InterruptOutcome::Answer(value) => value,
            InterruptOutcome::Cancelled => return Err(Exit::Cancelled),
        };

        self.state.pending_interrupt = None;
        self.state.record_human_input(&request.call_id, value);
        self.set_status(JobStatus::Running)?;
        self.checkpoint().await?;
        tracing::info!(job_id = %self.id, "Resuming with human input");
        Ok(())
    }

    async fn decide(&self) -> Flow<Result<Step, ToolError>> {
        let timeout = self.shared.config.decision_timeout;
        let call = self.shared.decisions.next_step(&self.state);
        self.bounded(call, timeout, "decision provider").await
    }

    async fn call_action(&self, invocation: &ToolInvocation) -> Flow<Result<Observation, ToolError>> {
        let timeout = self.shared.config.action_timeout;
        let call = self.shared.actions.execute(self.id, invocation);
        self.bounded(call, timeout, invocation.tool.as_str()).await
    }

    /// Await a provider call with a timeout, abandoning it on cancellation.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ToolError>>,
        timeout: Duration,
        what: &str,
    ) -> Flow<Result<T, ToolError>> {
        tokio::select! {
            _ = self.handle.cancel.cancelled() => Err(Exit::Cancelled),
            result = tokio::time::timeout(timeout, call) => Ok(result.unwrap_or_else(|_| {
                Err(ToolError::unavailable(format!("{} timed out after {:?}", what, timeout)))
            })),
        }
    }

    fn check_cancelled(&self) -> Flow {
        if self.handle.cancel.is_cancelled() {
            Err(Exit::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Count a step, failing the job once the ceiling is reached. Terminal
    /// decisions never count, so a job may finish at exactly `max_steps`.
    fn begin_step(&mut self) -> Flow {
        self.check_cancelled()?;
        let max_steps = self.shared.config.max_steps;
        if self.state.step_count >= max_steps {
            return Err(Exit::Failed(FailureReason::StepLimitExceeded(max_steps)));
        }
        self.state.step_count += 1;
        self.sync_progress();
        Ok(())
    }

    fn sync_progress(&self) {
        let mut live = self.handle.live.lock();
        live.job.step_count = self.state.step_count;
        live.job.updated_at = Utc::now();
        live.partial_result = self.state.partial_result.clone();
    }

    fn set_status(&self, status: JobStatus) -> Flow {
        self.transition(status, Some(EventKind::Status { status }))
    }

    /// Change status and publish `event` atomically with respect to `cancel`.
    fn transition(&self, status: JobStatus, event: Option<EventKind>) -> Flow {
        let mut live = self.handle.live.lock();
        if live.job.status.is_terminal() {
            return Err(Exit::Cancelled);
        }
        if live.job.status != status && !live.job.transition(status) {
            tracing::warn!(job_id = %self.id, from = %live.job.status, to = %status, "Ignoring invalid status transition");
        }
        if let Some(event) = event {
            self.shared.events.publish(self.id, event);
        }
        Ok(())
    }

    fn publish(&self, event: EventKind) -> Flow {
        let live = self.handle.live.lock();
        if live.job.status.is_terminal() {
            return Err(Exit::Cancelled);
        }
        self.shared.events.publish(self.id, event);
        Ok(())
    }

    fn snapshot(&self) -> Checkpoint {
        let mut job = self.handle.live.lock().job.clone();
        job.step_count = self.state.step_count;
        Checkpoint {
            job,
            state: self.state.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    async fn checkpoint(&self) -> Flow {
        let checkpoint = self.snapshot();
        self.shared
            .store
            .checkpoint(self.id, &checkpoint)
            .await
            .map_err(|e| {
                tracing::error!(job_id = %self.id, error = %e, "Checkpoint failed");
                Exit::Failed(FailureReason::Internal(format!("checkpoint failed: {}", e)))
            })
    }

    /// Record the terminal status, persist it and release the job's resources.
    async fn finish(mut self, exit: Exit, permit: Option<OwnedSemaphorePermit>) {
        self.state.pending_interrupt = None;
        self.in_flight = None;
        self.handle.interrupt.cancel();

        {
            let mut live = self.handle.live.lock();
            live.job.step_count = self.state.step_count;
            live.partial_result = self.state.partial_result.clone();

            if !live.job.status.is_terminal() {
                let (status, event) = match &exit {
                    Exit::Completed => (
                        JobStatus::Completed,
                        EventKind::Completed {
                            result: self.state.partial_result.clone(),
                        },
                    ),
                    Exit::Failed(reason) => (
                        JobStatus::Failed,
                        EventKind::Error {
                            message: reason.to_string(),
                            retryable: false,
                        },
                    ),
                    Exit::Cancelled => (
                        JobStatus::Cancelled,
                        EventKind::Error {
                            message: "Job cancelled".to_string(),
                            retryable: false,
                        },
                    ),
                };
                if live.job.transition(status) {
                    if let Exit::Failed(reason) = &exit {
                        live.job.failure = Some(reason.to_string());
                    }
                    self.shared.events.publish(self.id, event);
                } else {
                    tracing::error!(job_id = %self.id, from = %live.job.status, to = %status, "Invalid terminal transition");
                }
            }
        }
        self.shared.events.close(self.id);

        let view = self.handle.view();
        match &exit {
            Exit::Failed(reason) => {
                tracing::warn!(job_id = %self.id, status = %view.status, steps = view.step_count, reason = %reason, "Job finished")
            }
            _ => tracing::info!(job_id = %self.id, status = %view.status, steps = view.step_count, "Job finished"),
        }

        if let Err(e) = self.checkpoint().await {
            tracing::error!(job_id = %self.id, error = ?e, "Final checkpoint failed");
        }
        if let Some(archive) = &self.shared.archive {
            let job = self.handle.live.lock().job.clone();
            let record = JobRecord::from_job(&job, self.state.partial_result.clone());
            if let Err(e) = archive.record(&record).await {
                tracing::error!(job_id = %self.id, error = %e, "Failed to archive job");
            }
        }
        // Queued jobs may start while the session winds down.
        drop(permit);

        let timeout = self.shared.config.action_timeout;
        if tokio::time::timeout(timeout, self.shared.actions.close_session(self.id))
            .await
            .is_err()
        {
            tracing::warn!(job_id = %self.id, timeout = ?timeout, "Closing browser session timed out");
        }
    }
}
