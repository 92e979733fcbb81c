//! Persisted job records, written once when a job reaches a terminal status.
//!
//! Backed by SQLite; the orchestrator falls back to it for status queries
//! after a finished job has been evicted from memory.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{Job, JobId, JobStatus};

/// Final record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub target: String,
    pub status: JobStatus,
    pub step_count: u32,
    pub result: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn from_job(job: &Job, result: Map<String, Value>) -> Self {
        Self {
            id: job.id,
            target: job.target.clone(),
            status: job.status,
            step_count: job.step_count,
            result,
            failure: job.failure.clone(),
            created_at: job.created_at,
            completed_at: job.updated_at,
        }
    }
}

#[async_trait]
pub trait JobArchive: Send + Sync {
    /// Persist a terminal job. Each job is recorded at most once.
    async fn record(&self, record: &JobRecord) -> anyhow::Result<()>;

    async fn get(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;
}

pub type SharedArchive = Arc<dyn JobArchive>;

/// SQLite-backed archive.
pub struct SqliteArchive {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scrape_jobs (
    job_id       TEXT PRIMARY KEY,
    target_url   TEXT NOT NULL,
    status       TEXT NOT NULL,
    step_count   INTEGER NOT NULL,
    result       TEXT NOT NULL,
    failure      TEXT,
    created_at   TEXT NOT NULL,
    completed_at TEXT NOT NULL
);
";

impl SqliteArchive {
    /// Open (or create) the archive database at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open archive at {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Archive that lives only as long as the process.
    pub fn in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialise archive schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl JobArchive for SqliteArchive {
    async fn record(&self, record: &JobRecord) -> anyhow::Result<()> {
        let conn = Arc::clone(&self.conn);
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let result = serde_json::to_string(&record.result)?;
            let inserted = conn.lock().execute(
                "INSERT OR IGNORE INTO scrape_jobs
                 (job_id, target_url, status, step_count, result, failure, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.target,
                    record.status.as_str(),
                    record.step_count,
                    result,
                    record.failure,
                    record.created_at.to_rfc3339(),
                    record.completed_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                tracing::warn!(job_id = %record.id, "Job already archived; keeping first record");
            }
            Ok(())
        })
        .await?
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<JobRecord>> {
            let conn = conn.lock();
            let row = conn
                .query_row(
                    "SELECT target_url, status, step_count, result, failure, created_at, completed_at
                     FROM scrape_jobs WHERE job_id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((target, status, step_count, result, failure, created_at, completed_at)) =
                row
            else {
                return Ok(None);
            };

            Ok(Some(JobRecord {
                id,
                target,
                status: JobStatus::parse(&status)
                    .with_context(|| format!("Unknown status '{}' in archive", status))?,
                step_count,
                result: serde_json::from_str(&result)?,
                failure,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                completed_at: DateTime::parse_from_rfc3339(&completed_at)?.with_timezone(&Utc),
            }))
        })
        .await?
    }
}
