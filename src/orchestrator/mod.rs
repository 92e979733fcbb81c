//! Job registry and public control surface.
//!
//! Each submitted job gets a background worker (see `worker`) that runs the
//! reason/act/observe loop. Everything outside the worker talks to a job
//! through its [`JobHandle`]: status reads, cancellation, and resolving the
//! interrupt channel.

mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{JobRecord, SharedArchive};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult, ToolError};
use crate::events::{EventBus, EventKind, ObserverId, Subscription};
use crate::interrupt::InterruptChannel;
use crate::job::{validate_target, InterruptRequest, Job, JobId, JobState, JobStatus};
use crate::providers::{ActionProvider, DecisionProvider};
use crate::retry::{self, RetryDecision};
use crate::store::{Checkpoint, MemoryStateStore, SharedStateStore};

use worker::Worker;

/// Snapshot of a job for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub step_count: u32,
    pub partial_result: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<InterruptRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            target: record.target,
            session_id: None,
            status: record.status,
            step_count: record.step_count,
            partial_result: record.result,
            failure: record.failure,
            pending_interrupt: None,
            created_at: record.created_at,
            updated_at: record.completed_at,
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub awaiting_input: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Status-visible part of a job, shared between the worker and callers.
struct LiveJob {
    job: Job,
    partial_result: Map<String, Value>,
}

/// Per-job control block.
///
/// Status changes and event publication both happen under `live`, so once a
/// caller has moved the job to a terminal status nothing else is published.
pub(crate) struct JobHandle {
    live: Mutex<LiveJob>,
    interrupt: InterruptChannel,
    cancel: CancellationToken,
}

impl JobHandle {
    fn new(job: Job, partial_result: Map<String, Value>) -> Self {
        Self {
            interrupt: InterruptChannel::new(job.id),
            live: Mutex::new(LiveJob {
                job,
                partial_result,
            }),
            cancel: CancellationToken::new(),
        }
    }

    fn view(&self) -> JobView {
        let live = self.live.lock();
        JobView {
            id: live.job.id,
            target: live.job.target.clone(),
            session_id: live.job.session_id.clone(),
            status: live.job.status,
            step_count: live.job.step_count,
            partial_result: live.partial_result.clone(),
            failure: live.job.failure.clone(),
            pending_interrupt: self.interrupt.pending(),
            created_at: live.job.created_at,
            updated_at: live.job.updated_at,
        }
    }

    fn status(&self) -> JobStatus {
        self.live.lock().job.status
    }
}

pub(crate) struct Shared {
    config: OrchestratorConfig,
    jobs: DashMap<JobId, Arc<JobHandle>>,
    events: EventBus,
    store: SharedStateStore,
    archive: Option<SharedArchive>,
    actions: Arc<dyn ActionProvider>,
    decisions: Arc<dyn DecisionProvider>,
    permits: Arc<Semaphore>,
}

/// Runs scrape jobs. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<SharedStateStore>,
    archive: Option<SharedArchive>,
    actions: Arc<dyn ActionProvider>,
    decisions: Arc<dyn DecisionProvider>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: SharedStateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn archive(mut self, archive: SharedArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn build(self) -> Orchestrator {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        Orchestrator {
            shared: Arc::new(Shared {
                events: EventBus::new(self.config.event_buffer_cap),
                config: self.config,
                jobs: DashMap::new(),
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(MemoryStateStore::new())),
                archive: self.archive,
                actions: self.actions,
                decisions: self.decisions,
                permits,
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder(
        actions: Arc<dyn ActionProvider>,
        decisions: Arc<dyn DecisionProvider>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            store: None,
            archive: None,
            actions,
            decisions,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Create a job for `target` and start working on it in the background.
    pub async fn submit(
        &self,
        target: &str,
        session_id: Option<String>,
        config: Value,
    ) -> OrchestratorResult<JobId> {
        validate_target(target)?;

        let job = Job::new(target.trim().to_string(), session_id);
        let id = job.id;
        let state = JobState::new(job.target.clone(), config);

        self.shared
            .store
            .checkpoint(
                id,
                &Checkpoint {
                    job: job.clone(),
                    state: state.clone(),
                    in_flight: None,
                },
            )
            .await?;

        tracing::info!(job_id = %id, target = %job.target, "Job submitted");
        let handle = Arc::new(JobHandle::new(job, Map::new()));
        self.shared.jobs.insert(id, Arc::clone(&handle));
        self.spawn_worker(handle, state);
        Ok(id)
    }

    fn spawn_worker(&self, handle: Arc<JobHandle>, state: JobState) {
        let worker = Worker::new(Arc::clone(&self.shared), handle, state);
        tokio::spawn(worker.run());
    }

    fn handle(&self, id: JobId) -> Option<Arc<JobHandle>> {
        self.shared.jobs.get(&id).map(|h| Arc::clone(h.value()))
    }

    /// Stop a job. Idempotent: cancelling a finished job succeeds and changes nothing.
    pub async fn cancel(&self, id: JobId) -> OrchestratorResult<()> {
        let Some(handle) = self.handle(id) else {
            return match self.archived(id).await {
                Some(_) => Ok(()),
                None => Err(OrchestratorError::NotFound(id)),
            };
        };

        {
            let mut live = handle.live.lock();
            if live.job.status.is_terminal() {
                return Ok(());
            }
            live.job.transition(JobStatus::Cancelled);
            live.job.failure = Some("Cancelled by user".to_string());
            self.shared.events.publish(
                id,
                EventKind::Error {
                    message: "Job cancelled".to_string(),
                    retryable: false,
                },
            );
        }

        handle.cancel.cancel();
        handle.interrupt.cancel();
        tracing::info!(job_id = %id, "Job cancelled");
        Ok(())
    }

    /// Answer the job's outstanding interrupt.
    pub fn supply_human_input(&self, id: JobId, value: Value) -> OrchestratorResult<()> {
        let handle = self.handle(id).ok_or(OrchestratorError::NotFound(id))?;
        handle.interrupt.resolve(value)?;
        tracing::info!(job_id = %id, "Human input received");
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> OrchestratorResult<JobView> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle.view());
        }
        self.archived(id)
            .await
            .map(JobView::from)
            .ok_or(OrchestratorError::NotFound(id))
    }

    async fn archived(&self, id: JobId) -> Option<JobRecord> {
        let archive = self.shared.archive.as_ref()?;
        match archive.get(id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Archive lookup failed");
                None
            }
        }
    }

    /// Jobs currently held in memory, newest first.
    pub fn list_jobs(&self) -> Vec<JobView> {
        let mut jobs: Vec<JobView> = self.shared.jobs.iter().map(|h| h.value().view()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Most recent job submitted under `session_id`.
    pub fn latest_for_session(&self, session_id: &str) -> Option<JobId> {
        self.shared
            .jobs
            .iter()
            .filter_map(|h| {
                let live = h.value().live.lock();
                (live.job.session_id.as_deref() == Some(session_id))
                    .then(|| (live.job.created_at, live.job.id))
            })
            .max()
            .map(|(_, id)| id)
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for handle in self.shared.jobs.iter() {
            stats.total += 1;
            match handle.value().status() {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::AwaitingInput => stats.awaiting_input += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Attach the job's single observer, replacing any previous one.
    pub fn attach(&self, id: JobId) -> OrchestratorResult<Subscription> {
        if !self.shared.jobs.contains_key(&id) {
            return Err(OrchestratorError::NotFound(id));
        }
        Ok(self.shared.events.attach(id))
    }

    pub fn detach(&self, id: JobId, observer: ObserverId) {
        self.shared.events.detach(id, observer);
    }

    /// Resume every unfinished job found in the state store.
    ///
    /// A call that was executing at crash time is counted as a failed attempt
    /// and left for the next decision; an open interrupt is re-opened.
    pub async fn recover(&self) -> OrchestratorResult<usize> {
        let mut resumed = 0;
        for checkpoint in self.shared.store.list().await? {
            let Checkpoint {
                job,
                mut state,
                in_flight,
            } = checkpoint;
            if job.status.is_terminal() || self.shared.jobs.contains_key(&job.id) {
                continue;
            }
            let id = job.id;

            if let Some(invocation) = in_flight {
                let error = ToolError::recoverable(format!(
                    "{} was interrupted by an orchestrator restart",
                    invocation.tool
                ));
                let key = invocation.tool.as_str();
                let attempt = state.bump_retry(key);
                state.record_failure(Some(&invocation.call_id), &error, attempt);
                let decision =
                    retry::decide(error.class, attempt, self.shared.config.max_tool_retries);
                if decision == RetryDecision::EscalateToHuman && state.pending_interrupt.is_none() {
                    // The worker opens the stored request before deciding again.
                    state.reset_retry(key);
                    state.pending_interrupt = Some(InterruptRequest::escalation(
                        &invocation.call_id,
                        key,
                        attempt,
                        &error,
                    ));
                }
                self.shared.events.publish(
                    id,
                    EventKind::Error {
                        message: error.message.clone(),
                        retryable: true,
                    },
                );
                tracing::warn!(job_id = %id, tool = %invocation.tool, attempt, "In-flight call lost in restart");
            }
            state.record_note("Resumed from checkpoint after restart");

            tracing::info!(job_id = %id, status = %job.status, steps = state.step_count, "Resuming job");
            let handle = Arc::new(JobHandle::new(job, state.partial_result.clone()));
            self.shared.jobs.insert(id, Arc::clone(&handle));
            self.spawn_worker(handle, state);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Drop finished jobs older than `retention` from memory, the event bus
    /// and the state store. Returns how many were evicted.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let expired: Vec<JobId> = self
            .shared
            .jobs
            .iter()
            .filter(|h| {
                let live = h.value().live.lock();
                live.job.status.is_terminal() && live.job.updated_at <= cutoff
            })
            .map(|h| *h.key())
            .collect();

        for id in &expired {
            self.shared.jobs.remove(id);
            self.shared.events.remove(*id);
            if let Err(e) = self.shared.store.remove(*id).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to remove checkpoint");
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Evicted finished jobs");
        }
        expired.len()
    }

    /// Periodically evict finished jobs past the configured retention.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let retention = self.shared.config.job_retention;
        let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                orchestrator.evict_finished(retention).await;
            }
        })
    }
}
