//! Job state store: atomic checkpoint/restore of a job's working memory.
//!
//! - `MemoryStateStore`: sharded in-process map, for tests and single-run use
//! - `FileStateStore`: one JSON file per job, written via rename so readers
//!   never observe a partial checkpoint

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::job::{Job, JobId, JobState, ToolInvocation};

/// Everything needed to resume a job after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job: Job,
    pub state: JobState,
    /// Tool call that was executing when the checkpoint was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<ToolInvocation>,
}

#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Replace the job's checkpoint atomically.
    async fn checkpoint(&self, id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Last committed checkpoint, or `StoreError::NotFound`.
    async fn load(&self, id: JobId) -> Result<Checkpoint, StoreError>;

    /// All stored checkpoints (used for crash recovery).
    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError>;

    /// Delete a job's checkpoint. Missing checkpoints are not an error.
    async fn remove(&self, id: JobId) -> Result<(), StoreError>;
}

pub type SharedStateStore = Arc<dyn JobStateStore>;
