//! Decision provider that asks a chat model which tool to call next.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::DecisionProvider;
use crate::error::ToolError;
use crate::job::{JobState, Step, StepRecord, ToolInvocation, ToolName};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, Role, ToolCall, ToolDefinition};

const FINISH_TOOL: &str = "finish";
const GIVE_UP_TOOL: &str = "give_up";

pub struct LlmDecisionProvider {
    client: Arc<dyn LlmClient>,
    model: String,
    options: ChatOptions,
    tools: Vec<ToolDefinition>,
}

impl LlmDecisionProvider {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            options: ChatOptions {
                temperature: Some(0.0),
                max_tokens: None,
            },
            tools: tool_definitions(),
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl DecisionProvider for LlmDecisionProvider {
    async fn next_step(&self, state: &JobState) -> Result<Step, ToolError> {
        let messages = build_messages(state);
        let response = self
            .client
            .chat_completion(&self.model, &messages, Some(&self.tools), self.options.clone())
            .await?;
        parse_response(response)
    }
}

fn tool_definitions() -> Vec<ToolDefinition> {
    let mut tools: Vec<ToolDefinition> = ToolName::ALL
        .into_iter()
        .map(|tool| {
            ToolDefinition::function(tool.as_str(), tool.description(), tool.parameters_schema())
        })
        .collect();

    tools.push(ToolDefinition::function(
        FINISH_TOOL,
        "Finish the job once the page structure and form data have been extracted.",
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "What was extracted" }
            },
            "required": ["summary"]
        }),
    ));
    tools.push(ToolDefinition::function(
        GIVE_UP_TOOL,
        "Stop the job because the target cannot be scraped.",
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the job cannot continue" }
            },
            "required": ["reason"]
        }),
    ));
    tools
}

fn system_prompt(state: &JobState) -> String {
    let config = match &state.config {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    };
    format!(
        "You are a web scraping agent. Your task is to:\n\
         1. Navigate to the website: {target}\n\
         2. Analyze the page to identify forms and interactive elements\n\
         3. Extract form field information and metadata\n\
         4. If login is required, identify login forms\n\
         5. Fill out forms as needed to reach the information\n\
         6. Handle any CAPTCHAs or verification steps by requesting human input\n\
         7. Extract the final form data and structure\n\n\
         Configuration: {config}\n\n\
         Guidelines:\n\
         - Always start by navigating to the URL\n\
         - Analyze each page before taking actions\n\
         - Request human help for CAPTCHAs, email verification, or unclear situations\n\
         - Call `{finish}` when done, or `{give_up}` if the site cannot be scraped",
        target = state.target,
        config = config,
        finish = FINISH_TOOL,
        give_up = GIVE_UP_TOOL,
    )
}

/// Render the job history as a chat transcript.
///
/// Every action becomes an assistant tool call followed by exactly one tool
/// message that collects all its outcomes (observation, failures, human input).
fn build_messages(state: &JobState) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::new(Role::System, system_prompt(state)),
        ChatMessage::new(
            Role::User,
            format!("Begin by navigating to {} and analyzing its structure.", state.target),
        ),
    ];
    let mut results: HashMap<String, usize> = HashMap::new();

    for record in &state.records {
        match record {
            StepRecord::Action { invocation, .. } => {
                messages.push(ChatMessage::assistant_tool_calls(
                    invocation.thought.clone(),
                    vec![ToolCall::function(
                        invocation.call_id.clone(),
                        invocation.tool.as_str(),
                        invocation.arguments.to_string(),
                    )],
                ));
                results.insert(invocation.call_id.clone(), messages.len());
                messages.push(ChatMessage::tool_result(invocation.call_id.clone(), ""));
            }
            StepRecord::Observation {
                call_id,
                observation,
                ..
            } => {
                let mut text = observation.summary.clone();
                if !observation.data.is_null() {
                    text.push_str(&format!("\nData: {}", observation.data));
                }
                if !observation.fields.is_empty() {
                    text.push_str(&format!("\nFields: {}", Value::Object(observation.fields.clone())));
                }
                append_result(&mut messages, &results, call_id, text);
            }
            StepRecord::Failure {
                call_id: Some(call_id),
                error,
                attempt,
                ..
            } => {
                let text = format!("Attempt {} failed: {}", attempt, error.message);
                append_result(&mut messages, &results, call_id, text);
            }
            // Decision failures are the orchestrator's business, not the model's.
            StepRecord::Failure { call_id: None, .. } => {}
            StepRecord::HumanInput { call_id, value, .. } => {
                let text = format!("Human input: {}", render_value(value));
                if results.contains_key(call_id) {
                    append_result(&mut messages, &results, call_id, text);
                } else {
                    // Answer to an escalation that was not tied to a tool call.
                    messages.push(ChatMessage::new(Role::User, text));
                }
            }
            StepRecord::Note { text, .. } => {
                messages.push(ChatMessage::new(Role::User, format!("[orchestrator] {}", text)));
            }
        }
    }

    for message in messages.iter_mut().filter(|m| m.role == Role::Tool) {
        if message.content.as_deref().map_or(true, str::is_empty) {
            message.content = Some("No result recorded.".to_string());
        }
    }
    messages
}

fn append_result(
    messages: &mut [ChatMessage],
    results: &HashMap<String, usize>,
    call_id: &str,
    text: String,
) {
    match results.get(call_id).and_then(|&idx| messages.get_mut(idx)) {
        Some(message) => {
            let content = message.content.get_or_insert_with(String::new);
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&text);
        }
        None => tracing::debug!(call_id, "Result without a matching action; dropped from transcript"),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_response(response: ChatResponse) -> Result<Step, ToolError> {
    let content = response.content.filter(|c| !c.trim().is_empty());
    let Some(call) = response.tool_calls.and_then(|calls| calls.into_iter().next()) else {
        return Ok(Step::done(content.unwrap_or_else(|| "Finished".to_string())));
    };

    let arguments: Value = if call.function.arguments.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&call.function.arguments).map_err(|e| {
            ToolError::recoverable(format!(
                "Invalid arguments for {}: {}",
                call.function.name, e
            ))
        })?
    };

    match call.function.name.as_str() {
        FINISH_TOOL => Ok(Step::done(
            text_arg(&arguments, "summary").or(content).unwrap_or_default(),
        )),
        GIVE_UP_TOOL => Ok(Step::give_up(
            text_arg(&arguments, "reason").or(content).unwrap_or_default(),
        )),
        name => {
            let tool = ToolName::parse(name)
                .ok_or_else(|| ToolError::recoverable(format!("Unknown tool '{}'", name)))?;
            let mut invocation = ToolInvocation::new(tool, arguments).with_call_id(call.id);
            if let Some(thought) = content {
                invocation = invocation.with_thought(thought);
            }
            Ok(Step::Invoke(invocation))
        }
    }
}
