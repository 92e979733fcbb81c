//! Per-job event buffers with a single attached observer.
//!
//! Every job gets an ordered, capped buffer. Publishing never blocks: the
//! event is appended and, if an observer is attached, pushed to it through an
//! unbounded channel. Attaching replays the buffer first, then goes live.
//! A second attach replaces the first observer (last attacher wins).

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::job::{InputType, JobId, JobStatus};

/// Default number of buffered events per job.
pub const DEFAULT_BUFFER_CAP: usize = 500;

/// Payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The job started or resumed running.
    Status { status: JobStatus },
    /// An action completed.
    Progress {
        action: String,
        partial_result: Map<String, Value>,
    },
    /// The job is waiting for human input.
    Interrupt {
        prompt: String,
        input_type: InputType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    /// The job finished successfully.
    Completed { result: Map<String, Value> },
    Error { message: String, retryable: bool },
    /// `dropped` older events were evicted from the buffer before replay.
    Overflow { dropped: u64 },
}

impl EventKind {
    /// Wire name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Status { .. } => "status",
            EventKind::Progress { .. } => "progress",
            EventKind::Interrupt { .. } => "interrupt",
            EventKind::Completed { .. } => "completed",
            EventKind::Error { .. } => "error",
            EventKind::Overflow { .. } => "overflow",
        }
    }

    /// Events after which no more events are published for the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Completed { .. }
                | EventKind::Error {
                    retryable: false,
                    ..
                }
        )
    }
}

/// One observable unit, immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    /// Emission order within the job, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Observer identity, used to make `detach` a no-op for superseded observers.
pub type ObserverId = u64;

#[derive(Default)]
struct JobChannel {
    buffer: VecDeque<JobEvent>,
    next_seq: u64,
    dropped: u64,
    observer: Option<(ObserverId, mpsc::UnboundedSender<JobEvent>)>,
    closed: bool,
}

impl JobChannel {
    fn push(&mut self, event: JobEvent, cap: usize) {
        if self.buffer.len() >= cap {
            self.buffer.pop_front();
            self.dropped += 1;
        }
        self.buffer.push_back(event);
    }

    fn overflow_marker(&self, job_id: JobId) -> Option<JobEvent> {
        (self.dropped > 0).then(|| JobEvent {
            job_id,
            seq: 0,
            timestamp: Utc::now(),
            kind: EventKind::Overflow {
                dropped: self.dropped,
            },
        })
    }
}

/// Fan-out of job events to at most one observer per job.
pub struct EventBus {
    channels: DashMap<JobId, Arc<Mutex<JobChannel>>>,
    buffer_cap: usize,
    next_observer: AtomicU64,
}

impl EventBus {
    pub fn new(buffer_cap: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer_cap: buffer_cap.max(1),
            next_observer: AtomicU64::new(1),
        }
    }

    fn channel(&self, job_id: JobId) -> Arc<Mutex<JobChannel>> {
        // Clone the Arc out so the shard lock is released immediately.
        Arc::clone(self.channels.entry(job_id).or_default().value())
    }

    /// Append an event and deliver it to the attached observer, if any.
    ///
    /// Returns the published event, or `None` if the job's stream was
    /// already closed by a terminal event.
    pub fn publish(&self, job_id: JobId, kind: EventKind) -> Option<JobEvent> {
        let channel = self.channel(job_id);
        let mut ch = channel.lock();
        if ch.closed {
            tracing::debug!(%job_id, "Dropping event published after close");
            return None;
        }

        ch.next_seq += 1;
        let event = JobEvent {
            job_id,
            seq: ch.next_seq,
            timestamp: Utc::now(),
            kind,
        };
        ch.push(event.clone(), self.buffer_cap);

        let gone = match &ch.observer {
            Some((_, tx)) => tx.send(event.clone()).is_err(),
            None => false,
        };
        if gone {
            // Connection dropped; keep buffering for a later reconnect.
            ch.observer = None;
        }

        if event.kind.is_terminal() {
            ch.closed = true;
            ch.observer = None;
        }

        Some(event)
    }

    /// Attach an observer: buffered events first, then live ones.
    ///
    /// Any previously attached observer is detached and its stream ends.
    pub fn attach(&self, job_id: JobId) -> Subscription {
        let observer = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let channel = self.channel(job_id);
        let mut ch = channel.lock();
        if let Some(marker) = ch.overflow_marker(job_id) {
            let _ = tx.send(marker);
        }
        for event in &ch.buffer {
            let _ = tx.send(event.clone());
        }

        if ch.closed {
            drop(tx);
        } else {
            if ch.observer.is_some() {
                tracing::debug!(%job_id, "Replacing attached observer");
            }
            ch.observer = Some((observer, tx));
        }

        Subscription {
            job_id,
            observer,
            rx,
        }
    }

    /// Detach `observer` if it is still the attached one.
    pub fn detach(&self, job_id: JobId, observer: ObserverId) {
        if let Some(channel) = self.channels.get(&job_id).map(|c| Arc::clone(c.value())) {
            let mut ch = channel.lock();
            if matches!(&ch.observer, Some((id, _)) if *id == observer) {
                ch.observer = None;
            }
        }
    }

    /// End the live stream without publishing anything.
    pub fn close(&self, job_id: JobId) {
        let channel = self.channel(job_id);
        let mut ch = channel.lock();
        ch.closed = true;
        ch.observer = None;
    }

    pub fn has_observer(&self, job_id: JobId) -> bool {
        self.channels
            .get(&job_id)
            .map(|c| c.value().lock().observer.is_some())
            .unwrap_or(false)
    }

    /// Snapshot of the buffered events for a job.
    pub fn buffered(&self, job_id: JobId) -> Vec<JobEvent> {
        self.channels
            .get(&job_id)
            .map(|c| c.value().lock().buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a job's buffer entirely.
    pub fn remove(&self, job_id: JobId) {
        if let Some((_, channel)) = self.channels.remove(&job_id) {
            channel.lock().observer = None;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAP)
    }
}

/// Ordered stream of one job's events for one observer.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    observer: ObserverId,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Next event, or `None` once the stream is closed or superseded.
    pub async fn next(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Next event if one is ready right now.
    pub fn try_next(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn progress(n: usize) -> EventKind {
        EventKind::Progress {
            action: format!("step {}", n),
            partial_result: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_replay_then_live_in_order() {
        let bus = EventBus::default();
        let job = Uuid::new_v4();
        for n in 0..5 {
            bus.publish(job, progress(n));
        }

        let mut sub = bus.attach(job);
        for expected_seq in 1..=5 {
            assert_eq!(sub.next().await.unwrap().seq, expected_seq);
        }
        assert!(sub.try_next().is_none());

        bus.publish(job, progress(5));
        assert_eq!(sub.next().await.unwrap().seq, 6);
    }

    #[tokio::test]
    async fn test_last_attacher_wins() {
        let bus = EventBus::default();
        let job = Uuid::new_v4();
        let mut first = bus.attach(job);
        let mut second = bus.attach(job);

        bus.publish(job, progress(0));
        assert!(first.next().await.is_none());
        assert_eq!(second.next().await.unwrap().seq, 1);

        // The stale observer's detach must not affect the current one.
        bus.detach(job, first.observer());
        assert!(bus.has_observer(job));
        bus.detach(job, second.observer());
        assert!(!bus.has_observer(job));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_with_marker() {
        let bus = EventBus::new(3);
        let job = Uuid::new_v4();
        for n in 0..5 {
            bus.publish(job, progress(n));
        }

        let mut sub = bus.attach(job);
        let marker = sub.next().await.unwrap();
        assert_eq!(marker.kind, EventKind::Overflow { dropped: 2 });
        let seqs: Vec<u64> = (0..3).filter_map(|_| sub.try_next()).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_terminal_event_closes_stream() {
        let bus = EventBus::default();
        let job = Uuid::new_v4();
        let mut sub = bus.attach(job);

        bus.publish(
            job,
            EventKind::Completed {
                result: json!({ "field1": { "type": "text" } })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            },
        );
        assert!(matches!(
            sub.next().await.map(|e| e.kind),
            Some(EventKind::Completed { .. })
        ));
        assert!(sub.next().await.is_none());

        assert!(bus.publish(job, progress(9)).is_none());

        // Late observers still get the replay, then the stream ends.
        let mut late = bus.attach(job);
        assert_eq!(late.next().await.unwrap().seq, 1);
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_observer_keeps_buffering() {
        let bus = EventBus::default();
        let job = Uuid::new_v4();
        drop(bus.attach(job));

        bus.publish(job, progress(0));
        assert!(!bus.has_observer(job));
        assert_eq!(bus.buffered(job).len(), 1);

        let mut again = bus.attach(job);
        assert_eq!(again.next().await.unwrap().seq, 1);
    }

    #[test]
    fn test_event_wire_format() {
        let event = JobEvent {
            job_id: Uuid::nil(),
            seq: 1,
            timestamp: Utc::now(),
            kind: EventKind::Error {
                message: "Job cancelled".into(),
                retryable: false,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["retryable"], false);
        assert_eq!(value["seq"], 1);
    }
}
