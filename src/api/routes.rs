//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::archive::SqliteArchive;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::events::ObserverId;
use crate::job::JobStatus;
use crate::llm::OpenAiCompatClient;
use crate::orchestrator::{JobStats, JobView, Orchestrator};
use crate::providers::{HttpActionProvider, LlmDecisionProvider};
use crate::store::FileStateStore;

use super::types::*;
use super::ws;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(FileStateStore::new(config.state_dir.clone()).await?);
    let archive = Arc::new(SqliteArchive::open(&config.archive_path)?);
    let llm = Arc::new(OpenAiCompatClient::with_url(
        config.model_api_url.clone(),
        config.model_api_key.clone(),
    ));
    let decisions = Arc::new(LlmDecisionProvider::new(llm, config.model.clone()));
    let actions = Arc::new(HttpActionProvider::new(
        config.browser_api_url.clone(),
        config.browser_api_key.clone(),
    ));

    let orchestrator = Orchestrator::builder(actions, decisions)
        .config(config.orchestrator.clone())
        .store(store)
        .archive(archive)
        .build();

    let resumed = orchestrator.recover().await?;
    if resumed > 0 {
        tracing::info!(count = resumed, "Resumed unfinished jobs from checkpoints");
    }
    orchestrator.spawn_sweeper();

    let state = Arc::new(AppState { orchestrator });
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/input", post(supply_input))
        .route("/api/jobs/:id/events", get(stream_events))
        .route("/api/ws/:session_id", get(ws::job_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for SIGINT/SIGTERM. Unfinished jobs keep their checkpoints and are
/// resumed on the next start.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let stats = state.orchestrator.stats();
    tracing::info!(
        running = stats.running,
        awaiting_input = stats.awaiting_input,
        queued = stats.queued,
        "Shutdown signal received; unfinished jobs will resume from their checkpoints"
    );
}

/// Map an orchestrator error to an HTTP status.
pub(super) fn error_response(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NoPendingInterrupt(_) | OrchestratorError::AlreadyPending(_) => {
            StatusCode::CONFLICT
        }
        OrchestratorError::TypeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::Store(e) => {
            tracing::error!(error = %e, "State store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

/// Detaches an observer when the connection that owns it goes away.
pub(super) struct ObserverGuard {
    state: Arc<AppState>,
    job_id: Uuid,
    observer: ObserverId,
}

impl ObserverGuard {
    pub(super) fn new(state: Arc<AppState>, job_id: Uuid, observer: ObserverId) -> Self {
        Self {
            state,
            job_id,
            observer,
        }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.state.orchestrator.detach(self.job_id, self.observer);
        tracing::debug!(job_id = %self.job_id, observer = self.observer, "Observer detached");
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<JobStats> {
    Json(state.orchestrator.stats())
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, (StatusCode, String)> {
    let id = state
        .orchestrator
        .submit(&req.url, req.session_id, req.config)
        .await
        .map_err(error_response)?;

    Ok(Json(CreateJobResponse {
        id,
        status: JobStatus::Queued,
    }))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    Json(state.orchestrator.list_jobs())
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, (StatusCode, String)> {
    state
        .orchestrator
        .get_job(id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .orchestrator
        .cancel(id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn supply_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<HumanInputRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .orchestrator
        .supply_human_input(id, req.value)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replay buffered events, then stream live ones until the job finishes.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let mut subscription = state.orchestrator.attach(id).map_err(error_response)?;
    let guard = ObserverGuard::new(Arc::clone(&state), id, subscription.observer());

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = subscription.next().await {
            match Event::default().event(event.kind.name()).json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to encode event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
