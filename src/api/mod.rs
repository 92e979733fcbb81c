//! HTTP API: job submission and control, status queries, and real-time
//! event delivery over SSE and WebSocket.

mod routes;
pub mod types;
mod ws;

pub use routes::{router, serve, AppState};
