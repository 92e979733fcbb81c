//! In-memory state store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Checkpoint, JobStateStore};
use crate::error::StoreError;
use crate::job::JobId;

/// Keeps checkpoints in a sharded map; lost on restart.
#[derive(Default)]
pub struct MemoryStateStore {
    checkpoints: DashMap<JobId, Checkpoint>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl JobStateStore for MemoryStateStore {
    async fn checkpoint(&self, id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        // Whole-value replace under the shard lock.
        self.checkpoints.insert(id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Checkpoint, StoreError> {
        self.checkpoints
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self.checkpoints.iter().map(|c| c.value().clone()).collect())
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        self.checkpoints.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobState, Observation, ToolInvocation, ToolName};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_checkpoint_load_round_trip() {
        let store = MemoryStateStore::new();
        let job = Job::new("https://example.com".into(), None);
        let mut state = JobState::new("https://example.com", json!({ "depth": 1 }));
        state.record_observation("c1", Observation::new("ok").with_field("a", json!(1)));

        let checkpoint = Checkpoint {
            job: job.clone(),
            state,
            in_flight: Some(ToolInvocation::new(ToolName::Analyze, json!({}))),
        };
        store.checkpoint(job.id, &checkpoint).await.unwrap();
        assert_eq!(store.load(job.id).await.unwrap(), checkpoint);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_load_unknown_is_not_found() {
        let store = MemoryStateStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id).await, Err(StoreError::NotFound(x)) if x == id));
        store.remove(id).await.unwrap();
    }
}
