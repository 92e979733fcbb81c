//! WebSocket channel for following a job and answering its interrupts.
//!
//! The server pushes every job event as a JSON text frame. The client can
//! send `human_input`, `cancel` and `ping`. Closing the socket only detaches
//! the observer; the job keeps running and buffers events for a reconnect.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::Subscription;

use super::routes::{error_response, AppState, ObserverGuard};
use super::types::{ClientMessage, ServerMessage, WsParams};

/// WebSocket endpoint for one session's job.
pub async fn job_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
) -> Response {
    let job_id = match params
        .job_id
        .or_else(|| state.orchestrator.latest_for_session(&session_id))
    {
        Some(id) => id,
        None => {
            return (
                StatusCode::NOT_FOUND,
                format!("No job for session {}", session_id),
            )
                .into_response()
        }
    };

    let subscription = match state.orchestrator.attach(job_id) {
        Ok(s) => s,
        Err(e) => return error_response(e).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, job_id, subscription))
}

fn to_text<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode websocket message");
            None
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    job_id: Uuid,
    mut subscription: Subscription,
) {
    tracing::info!(session_id = %session_id, job_id = %job_id, "WebSocket observer attached");
    let _guard = ObserverGuard::new(Arc::clone(&state), job_id, subscription.observer());

    // Replies to client messages share the sender with job events.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let recv_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let command = match serde_json::from_str::<ClientMessage>(&text) {
                Ok(c) => c,
                Err(e) => {
                    let _ = reply_tx.send(ServerMessage::Rejected {
                        message: format!("Invalid message: {}", e),
                    });
                    continue;
                }
            };

            match command {
                ClientMessage::Ping => {
                    let _ = reply_tx.send(ServerMessage::Pong);
                }
                ClientMessage::HumanInput { value } => {
                    if let Err(e) = recv_state.orchestrator.supply_human_input(job_id, value) {
                        let _ = reply_tx.send(ServerMessage::Rejected {
                            message: e.to_string(),
                        });
                    }
                }
                ClientMessage::Cancel => {
                    if let Err(e) = recv_state.orchestrator.cancel(job_id).await {
                        let _ = reply_tx.send(ServerMessage::Rejected {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = subscription.next() => match event {
                    Some(event) => to_text(&event),
                    // Job finished or another observer took over.
                    None => break,
                },
                Some(reply) = reply_rx.recv() => to_text(&reply),
            };
            if let Some(message) = message {
                if ws_sender.send(message).await.is_err() {
                    tracing::debug!(job_id = %job_id, "Client disconnected");
                    return;
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    tokio::select! {
        _ = &mut recv_task => {
            send_task.abort();
        }
        _ = &mut send_task => {
            recv_task.abort();
        }
    }

    tracing::info!(session_id = %session_id, job_id = %job_id, "WebSocket observer detached");
}
