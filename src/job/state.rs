//! Working memory of a running job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::invocation::{InterruptRequest, Observation, ToolInvocation};
use crate::error::ToolError;

/// One entry of the job's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepRecord {
    /// The decision provider requested a tool call.
    Action {
        invocation: ToolInvocation,
        at: DateTime<Utc>,
    },
    /// A tool call succeeded.
    Observation {
        call_id: String,
        observation: Observation,
        at: DateTime<Utc>,
    },
    /// A tool call (or a decision request) failed.
    Failure {
        call_id: Option<String>,
        error: ToolError,
        attempt: u32,
        at: DateTime<Utc>,
    },
    /// A human answered an interrupt.
    HumanInput {
        call_id: String,
        value: Value,
        at: DateTime<Utc>,
    },
    /// Free-form note from the orchestrator itself (e.g. resumed after restart).
    Note { text: String, at: DateTime<Utc> },
}

impl StepRecord {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            StepRecord::Action { invocation, .. } => Some(&invocation.call_id),
            StepRecord::Observation { call_id, .. } | StepRecord::HumanInput { call_id, .. } => {
                Some(call_id)
            }
            StepRecord::Failure { call_id, .. } => call_id.as_deref(),
            StepRecord::Note { .. } => None,
        }
    }
}

/// Everything the loop has accumulated for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub target: String,
    /// Free-form configuration supplied at submission.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub records: Vec<StepRecord>,
    /// Extracted result so far. Keys are only ever added or overwritten.
    #[serde(default)]
    pub partial_result: Map<String, Value>,
    /// Consecutive failures per tool key.
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub step_count: u32,
    /// Interrupt that was open when the state was last checkpointed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<InterruptRequest>,
}

impl JobState {
    pub fn new(target: impl Into<String>, config: Value) -> Self {
        Self {
            target: target.into(),
            config,
            ..Default::default()
        }
    }

    pub fn record_action(&mut self, invocation: &ToolInvocation) {
        self.records.push(StepRecord::Action {
            invocation: invocation.clone(),
            at: Utc::now(),
        });
    }

    /// Append a successful observation and merge its fields into the result.
    pub fn record_observation(&mut self, call_id: &str, observation: Observation) {
        self.merge_fields(&observation.fields);
        self.records.push(StepRecord::Observation {
            call_id: call_id.to_string(),
            observation,
            at: Utc::now(),
        });
    }

    pub fn record_failure(&mut self, call_id: Option<&str>, error: &ToolError, attempt: u32) {
        self.records.push(StepRecord::Failure {
            call_id: call_id.map(str::to_string),
            error: error.clone(),
            attempt,
            at: Utc::now(),
        });
    }

    pub fn record_human_input(&mut self, call_id: &str, value: Value) {
        self.records.push(StepRecord::HumanInput {
            call_id: call_id.to_string(),
            value,
            at: Utc::now(),
        });
    }

    pub fn record_note(&mut self, text: impl Into<String>) {
        self.records.push(StepRecord::Note {
            text: text.into(),
            at: Utc::now(),
        });
    }

    /// Last-write-wins merge; existing keys are never removed.
    pub fn merge_fields(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            self.partial_result.insert(key.clone(), value.clone());
        }
    }

    /// Count one more consecutive failure for `key` and return the new total.
    pub fn bump_retry(&mut self, key: &str) -> u32 {
        let counter = self.retries.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset_retry(&mut self, key: &str) {
        self.retries.remove(key);
    }

    pub fn retry_count(&self, key: &str) -> u32 {
        self.retries.get(key).copied().unwrap_or(0)
    }

    /// The most recent action record, if any.
    pub fn last_action(&self) -> Option<&ToolInvocation> {
        self.records.iter().rev().find_map(|r| match r {
            StepRecord::Action { invocation, .. } => Some(invocation),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ToolName;
    use serde_json::json;

    #[test]
    fn test_partial_result_grows_monotonically() {
        let mut state = JobState::new("https://example.com", Value::Null);
        state.record_observation(
            "c1",
            Observation::new("found").with_field("email", json!({ "type": "email" })),
        );
        state.record_observation(
            "c2",
            Observation::new("found more").with_field("password", json!({ "type": "password" })),
        );
        state.record_observation("c3", Observation::new("nothing new"));

        let keys: Vec<_> = state.partial_result.keys().cloned().collect();
        assert_eq!(keys, vec!["email", "password"]);
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let mut state = JobState::default();
        let mut first = Map::new();
        first.insert("field1".into(), json!({ "type": "text" }));
        state.merge_fields(&first);

        let mut second = Map::new();
        second.insert("field1".into(), json!({ "type": "email" }));
        state.merge_fields(&second);

        assert_eq!(state.partial_result["field1"], json!({ "type": "email" }));
    }

    #[test]
    fn test_retry_counters_are_per_key() {
        let mut state = JobState::default();
        assert_eq!(state.bump_retry("navigate"), 1);
        assert_eq!(state.bump_retry("navigate"), 2);
        assert_eq!(state.bump_retry("fill"), 1);
        state.reset_retry("navigate");
        assert_eq!(state.retry_count("navigate"), 0);
        assert_eq!(state.retry_count("fill"), 1);
    }

    #[test]
    fn test_records_keep_insertion_order() {
        let mut state = JobState::default();
        let inv = ToolInvocation::new(ToolName::Analyze, json!({})).with_call_id("c1");
        state.record_action(&inv);
        state.record_failure(Some("c1"), &ToolError::recoverable("boom"), 1);
        state.record_observation("c1", Observation::new("ok"));

        let ids: Vec<_> = state.records.iter().filter_map(StepRecord::call_id).collect();
        assert_eq!(ids, vec!["c1", "c1", "c1"]);
        assert!(matches!(state.records[1], StepRecord::Failure { attempt: 1, .. }));
        assert_eq!(state.last_action().map(|i| i.tool), Some(ToolName::Analyze));
    }
}
