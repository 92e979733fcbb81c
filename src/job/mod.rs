//! Job module - defines jobs, their working state, and the tool protocol.
//!
//! - `Job` is the externally visible record (status, step count, timestamps)
//! - `JobState` is the loop's working memory, checkpointed after every mutation
//! - `ToolInvocation` / `Step` are what the decision provider emits

mod invocation;
mod record;
mod state;

pub use invocation::{
    InputType, InterruptRequest, Observation, Step, TerminalDecision, ToolInvocation, ToolName,
};
pub use record::{validate_target, Job, JobId, JobStatus};
pub use state::{JobState, StepRecord};
