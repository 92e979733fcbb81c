//! Per-job single-slot rendezvous for human input.
//!
//! The job worker opens a request and parks on the returned waiter; an API
//! caller resolves it (or the job is cancelled). This is the only place the
//! job loop blocks without a timeout.

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::job::{InterruptRequest, JobId};

/// How a pending interrupt was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptOutcome {
    Answer(Value),
    Cancelled,
}

struct Pending {
    request: InterruptRequest,
    responder: oneshot::Sender<InterruptOutcome>,
}

/// At most one outstanding `InterruptRequest` per job.
pub struct InterruptChannel {
    job_id: JobId,
    slot: Mutex<Option<Pending>>,
}

/// Handle the worker awaits until the interrupt is resolved.
#[derive(Debug)]
pub struct InterruptWaiter {
    rx: oneshot::Receiver<InterruptOutcome>,
}

impl InterruptWaiter {
    /// Wait for the answer. A dropped channel counts as cancellation.
    pub async fn wait(self) -> InterruptOutcome {
        self.rx.await.unwrap_or(InterruptOutcome::Cancelled)
    }
}

impl InterruptChannel {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            slot: Mutex::new(None),
        }
    }

    /// Occupy the slot. Fails with `AlreadyPending` if a request is outstanding.
    pub fn open(&self, request: InterruptRequest) -> OrchestratorResult<InterruptWaiter> {
        let mut slot = self.slot.lock();
        if let Some(pending) = slot.as_ref() {
            // A waiter that went away no longer holds the slot.
            if !pending.responder.is_closed() {
                return Err(OrchestratorError::AlreadyPending(self.job_id));
            }
        }

        let (tx, rx) = oneshot::channel();
        *slot = Some(Pending {
            request,
            responder: tx,
        });
        Ok(InterruptWaiter { rx })
    }

    /// Answer the outstanding request.
    ///
    /// A value of the wrong shape is rejected and the request stays pending.
    pub fn resolve(&self, value: Value) -> OrchestratorResult<()> {
        let mut slot = self.slot.lock();
        let pending = slot
            .as_ref()
            .ok_or(OrchestratorError::NoPendingInterrupt(self.job_id))?;

        if !pending.request.input_type.accepts(&value) {
            return Err(OrchestratorError::TypeMismatch {
                expected: pending.request.input_type.describe(),
            });
        }

        let pending = slot
            .take()
            .ok_or(OrchestratorError::NoPendingInterrupt(self.job_id))?;
        pending
            .responder
            .send(InterruptOutcome::Answer(value))
            .map_err(|_| OrchestratorError::NoPendingInterrupt(self.job_id))
    }

    /// Wake any waiter with a cancellation. Always succeeds.
    pub fn cancel(&self) {
        if let Some(pending) = self.slot.lock().take() {
            let _ = pending.responder.send(InterruptOutcome::Cancelled);
        }
    }

    /// The outstanding request, if any.
    pub fn pending(&self) -> Option<InterruptRequest> {
        self.slot.lock().as_ref().map(|p| p.request.clone())
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}
