//! File-backed state store: `{dir}/{job_id}.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use super::{Checkpoint, JobStateStore};
use crate::error::StoreError;
use crate::job::JobId;

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Open (creating if needed) a checkpoint directory.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl JobStateStore for FileStateStore {
    async fn checkpoint(&self, id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(checkpoint)?;

        // Unique temp name so concurrent writers never share a file; the
        // rename is what makes the new checkpoint visible.
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", id, Uuid::new_v4().simple()));
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, self.path_for(id)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Checkpoint, StoreError> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_checkpoint = path.extension().map(|e| e == "json").unwrap_or(false)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(true);
            if !is_checkpoint {
                continue;
            }

            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Checkpoint>(&bytes) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable checkpoint {}: {}", path.display(), e)
                    }
                },
                Err(e) => tracing::warn!("Failed to read checkpoint {}: {}", path.display(), e),
            }
        }

        Ok(checkpoints)
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{InputType, InterruptRequest, Job, JobState, JobStatus};
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_checkpoint() -> Checkpoint {
        let mut job = Job::new("https://example.com".into(), Some("client-1".into()));
        job.transition(JobStatus::Running);
        job.step_count = 2;

        let mut state = JobState::new("https://example.com", json!({}));
        state.step_count = 2;
        state.bump_retry("navigate");
        state.pending_interrupt = Some(InterruptRequest {
            call_id: "call_9".into(),
            prompt: "Enter code".into(),
            input_type: InputType::Choice {
                options: vec!["a".into(), "b".into()],
            },
            context: None,
        });

        Checkpoint {
            job,
            state,
            in_flight: None,
        }
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let temp = tempdir().unwrap();
        let store = FileStateStore::new(temp.path().join("checkpoints")).await.unwrap();

        let checkpoint = sample_checkpoint();
        let id = checkpoint.job.id;
        store.checkpoint(id, &checkpoint).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), checkpoint);

        // Overwrite replaces the whole value.
        let mut next = checkpoint.clone();
        next.state.step_count = 3;
        store.checkpoint(id, &next).await.unwrap();
        assert_eq!(store.load(id).await.unwrap().state.step_count, 3);
    }

    #[tokio::test]
    async fn test_file_store_list_and_remove() {
        let temp = tempdir().unwrap();
        let store = FileStateStore::new(temp.path()).await.unwrap();

        let a = sample_checkpoint();
        let b = sample_checkpoint();
        store.checkpoint(a.job.id, &a).await.unwrap();
        store.checkpoint(b.job.id, &b).await.unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);

        store.remove(a.job.id).await.unwrap();
        store.remove(a.job.id).await.unwrap();
        assert!(matches!(
            store.load(a.job.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_skipped_by_list() {
        let temp = tempdir().unwrap();
        let store = FileStateStore::new(temp.path()).await.unwrap();
        std::fs::write(temp.path().join(format!("{}.json", Uuid::new_v4())), "{not json").unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
