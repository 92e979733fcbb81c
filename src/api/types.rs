//! API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::JobStatus;

/// Request to submit a new scrape job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    /// Target page to scrape
    pub url: String,

    /// Real-time channel that should follow this job
    #[serde(default)]
    pub session_id: Option<String>,

    /// Free-form settings handed to the decision provider
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobResponse {
    pub id: Uuid,
    pub status: JobStatus,
}

/// Answer to a pending interrupt.
#[derive(Debug, Clone, Deserialize)]
pub struct HumanInputRequest {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Job to follow; defaults to the session's most recent job.
    pub job_id: Option<Uuid>,
}

/// Messages a WebSocket client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    HumanInput { value: Value },
    Cancel,
    Ping,
}

/// Replies to client messages. Job events are sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    /// A client request was refused (no pending interrupt, wrong input type).
    Rejected { message: String },
}
