//! Action provider backed by a remote browser automation service.
//!
//! One browser session per job. The service exposes:
//! - `POST {base}/sessions` -> `{"id": "..."}`
//! - `POST {base}/sessions/{id}/actions` with `{"tool", "arguments"}` -> observation
//! - `DELETE {base}/sessions/{id}`

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::ActionProvider;
use crate::error::{ErrorClass, ToolError};
use crate::job::{JobId, Observation, ToolInvocation};

pub struct HttpActionProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    sessions: DashMap<JobId, String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(alias = "session_id")]
    id: String,
}

impl HttpActionProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            sessions: DashMap::new(),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn create_session(&self, job_id: JobId) -> Result<String, ToolError> {
        let request = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&json!({ "job_id": job_id }));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| request_error("create browser session", e))?;

        let status = response.status();
        let body = read_body("create browser session", response).await?;
        if !status.is_success() {
            return Err(status_error("create browser session", status, &body));
        }
        let session: SessionResponse = serde_json::from_str(&body).map_err(|e| {
            ToolError::unavailable(format!("Invalid session response: {}, body: {}", e, body))
        })?;

        tracing::info!(job_id = %job_id, session_id = %session.id, "Browser session created");
        self.sessions.insert(job_id, session.id.clone());
        Ok(session.id)
    }

    async fn session_for(&self, job_id: JobId) -> Result<String, ToolError> {
        if let Some(session) = self.sessions.get(&job_id) {
            return Ok(session.clone());
        }
        self.create_session(job_id).await
    }
}

#[async_trait]
impl ActionProvider for HttpActionProvider {
    async fn open_session(&self, job_id: JobId) -> Result<(), ToolError> {
        self.session_for(job_id).await.map(|_| ())
    }

    async fn execute(
        &self,
        job_id: JobId,
        invocation: &ToolInvocation,
    ) -> Result<Observation, ToolError> {
        let session = self.session_for(job_id).await?;
        let what = invocation.tool.as_str();

        tracing::debug!(job_id = %job_id, tool = what, call_id = %invocation.call_id, "Executing action");

        let request = self
            .client
            .post(format!("{}/sessions/{}/actions", self.base_url, session))
            .json(&json!({
                "tool": what,
                "arguments": invocation.arguments,
            }));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| request_error(what, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // Session expired on the remote side; the next attempt opens a new one.
            self.sessions.remove(&job_id);
        }
        let body = read_body(what, response).await?;
        if !status.is_success() {
            return Err(status_error(what, status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            ToolError::recoverable(format!("{} returned an unreadable observation: {}", what, e))
        })
    }

    async fn close_session(&self, job_id: JobId) {
        let Some((_, session)) = self.sessions.remove(&job_id) else {
            return;
        };
        let request = self
            .client
            .delete(format!("{}/sessions/{}", self.base_url, session));
        match self.authorize(request).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(job_id = %job_id, session_id = %session, "Browser session closed");
            }
            Ok(response) => {
                tracing::warn!(job_id = %job_id, status = %response.status(), "Failed to close browser session");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to close browser session");
            }
        }
    }
}

/// Map an HTTP status from the automation service to an error class.
fn classify_status(status: StatusCode) -> ErrorClass {
    match status.as_u16() {
        401 | 403 => ErrorClass::NonRecoverable,
        429 | 500..=599 => ErrorClass::ProviderUnavailable,
        _ => ErrorClass::Recoverable,
    }
}

fn status_error(what: &str, status: StatusCode, body: &str) -> ToolError {
    ToolError {
        class: classify_status(status),
        message: format!("{} failed (HTTP {}): {}", what, status.as_u16(), body),
    }
}

async fn read_body(what: &str, response: Response) -> Result<String, ToolError> {
    let status = response.status();
    response.text().await.map_err(|e| {
        ToolError::unavailable(format!(
            "{}: failed to read response body (HTTP {}): {}",
            what,
            status.as_u16(),
            e
        ))
    })
}

fn request_error(what: &str, err: reqwest::Error) -> ToolError {
    let message = if err.is_timeout() {
        format!("{} timed out: {}", what, err)
    } else if err.is_connect() {
        format!("{}: connection failed: {}", what, err)
    } else {
        format!("{} request failed: {}", what, err)
    };
    ToolError::unavailable(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ToolName;
    use uuid::Uuid;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorClass::NonRecoverable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorClass::NonRecoverable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorClass::ProviderUnavailable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            ErrorClass::ProviderUnavailable
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ErrorClass::Recoverable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorClass::Recoverable);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = HttpActionProvider::new("http://localhost:3000/", None);
        assert_eq!(provider.base_url, "http://localhost:3000");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let provider = HttpActionProvider::new("http://127.0.0.1:1", None);
        let invocation = ToolInvocation::new(
            ToolName::Navigate,
            serde_json::json!({ "url": "https://example.com" }),
        );

        let err = provider
            .execute(Uuid::new_v4(), &invocation)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::ProviderUnavailable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_truncated_body_is_reported() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            // Promise more body than is sent, then hang up.
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n{\"id\":")
                .await;
        });

        let provider = HttpActionProvider::new(format!("http://{}", addr), None);
        let err = provider.open_session(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::ProviderUnavailable);
        assert!(err.message.contains("failed to read response body (HTTP 200)"));
        assert!(provider.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_close_without_session_is_noop() {
        let provider = HttpActionProvider::new("http://127.0.0.1:1", None);
        provider.close_session(Uuid::new_v4()).await;
        assert!(provider.sessions.is_empty());
    }
}
