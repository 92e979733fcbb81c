//! # Scrape Orchestrator
//!
//! Runs long-lived web scraping jobs driven by an AI decision loop, with a
//! human in the loop for CAPTCHAs, verification codes and anything else the
//! agent cannot resolve on its own.
//!
//! ## Job Flow
//! 1. A job is submitted with a target URL and queued
//! 2. A worker asks the decision provider for the next step
//! 3. Actions run against a remote browser; observations feed back into the
//!    job state, which is checkpointed after every step
//! 4. When the agent (or the retry policy) needs a human, the job suspends
//!    on its interrupt channel until an answer arrives
//! 5. Every change is published on the job's event stream
//!
//! ```text
//!   submit ──▶ queued ──▶ running ◀──▶ awaiting_input
//!                 │          │               │
//!                 ▼          ▼               ▼
//!             cancelled   completed / failed / cancelled
//! ```
//!
//! ## Modules
//! - `orchestrator`: job registry and the per-job loop
//! - `providers`: action and decision providers (HTTP browser service, LLM, scripted)
//! - `interrupt`: single-slot human input rendezvous
//! - `events`: buffered per-job event streams
//! - `store`: checkpoints for crash recovery
//! - `archive`: records of finished jobs
//! - `api`: HTTP, SSE and WebSocket surface

pub mod api;
pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod job;
pub mod llm;
pub mod orchestrator;
pub mod providers;
pub mod retry;
pub mod store;

pub use config::{Config, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult, ToolError};
pub use orchestrator::{JobStats, JobView, Orchestrator};
