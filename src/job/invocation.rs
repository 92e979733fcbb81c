//! Tool protocol between the job loop and the two providers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::ToolError;

/// The fixed set of operations the decision provider may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    Navigate,
    Fill,
    Analyze,
    RequestHumanInput,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::Navigate,
        ToolName::Fill,
        ToolName::Analyze,
        ToolName::RequestHumanInput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::Navigate => "navigate",
            ToolName::Fill => "fill",
            ToolName::Analyze => "analyze",
            ToolName::RequestHumanInput => "request_human_input",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::Navigate => {
                "Navigate the browser to a URL. Always start by navigating to the target."
            }
            ToolName::Fill => {
                "Fill form fields. Maps CSS selectors to the values to type into them."
            }
            ToolName::Analyze => {
                "Analyze the current page for forms and interactive elements. Returns the \
                 discovered form fields, which are merged into the job result."
            }
            ToolName::RequestHumanInput => {
                "Ask the human operator for help: CAPTCHAs, verification codes, or any \
                 situation that is unclear. Blocks until the human answers."
            }
        }
    }

    /// JSON schema of the tool's arguments.
    pub fn parameters_schema(self) -> Value {
        match self {
            ToolName::Navigate => json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to navigate to" }
                },
                "required": ["url"]
            }),
            ToolName::Fill => json!({
                "type": "object",
                "properties": {
                    "fields": {
                        "type": "object",
                        "description": "Map of field selector to value",
                        "additionalProperties": { "type": "string" }
                    }
                },
                "required": ["fields"]
            }),
            ToolName::Analyze => json!({
                "type": "object",
                "properties": {
                    "instruction": {
                        "type": "string",
                        "description": "What to look for on the page"
                    }
                }
            }),
            ToolName::RequestHumanInput => json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Message shown to the human" },
                    "input_type": {
                        "type": "string",
                        "enum": ["text", "choice", "confirmation"],
                        "description": "Kind of answer expected (default: text)"
                    },
                    "options": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Allowed answers when input_type is choice"
                    }
                },
                "required": ["prompt"]
            }),
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single requested tool call. Lives for one loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Correlates the call with its observation in the job's history.
    pub call_id: String,
    pub tool: ToolName,
    #[serde(default)]
    pub arguments: Value,
    /// Reasoning the decision provider attached to this call, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

impl ToolInvocation {
    pub fn new(tool: ToolName, arguments: Value) -> Self {
        Self {
            call_id: format!("call_{}", Uuid::new_v4().simple()),
            tool,
            arguments,
            thought: None,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    /// Short human-readable description for progress events.
    pub fn describe(&self) -> String {
        match self.tool {
            ToolName::Navigate => match self.arguments.get("url").and_then(Value::as_str) {
                Some(url) => format!("Navigating to {}", url),
                None => "Navigating".to_string(),
            },
            ToolName::Fill => {
                let count = self
                    .arguments
                    .get("fields")
                    .and_then(Value::as_object)
                    .map_or(0, Map::len);
                format!("Filling {} form field(s)", count)
            }
            ToolName::Analyze => "Analyzing page content".to_string(),
            ToolName::RequestHumanInput => "Requesting human input".to_string(),
        }
    }
}

/// Terminal outcome chosen by the decision provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TerminalDecision {
    Done { summary: String },
    GiveUp { reason: String },
}

/// What the decision provider wants next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Invoke(ToolInvocation),
    Finish(TerminalDecision),
}

impl Step {
    pub fn invoke(tool: ToolName, arguments: Value) -> Self {
        Step::Invoke(ToolInvocation::new(tool, arguments))
    }

    pub fn done(summary: impl Into<String>) -> Self {
        Step::Finish(TerminalDecision::Done {
            summary: summary.into(),
        })
    }

    pub fn give_up(reason: impl Into<String>) -> Self {
        Step::Finish(TerminalDecision::GiveUp {
            reason: reason.into(),
        })
    }
}

/// Result of a successfully executed action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub summary: String,
    #[serde(default)]
    pub data: Value,
    /// Discovered result fields, merged into the job's partial result.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Observation {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Shape of the answer an interrupt expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputType {
    /// Any string.
    Text,
    /// One of a fixed list of strings.
    Choice { options: Vec<String> },
    /// A yes/no answer as a JSON boolean.
    Confirmation,
}

impl InputType {
    /// Whether `value` has the shape this input type expects.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (InputType::Text, Value::String(_)) => true,
            (InputType::Choice { options }, Value::String(s)) => options.iter().any(|o| o == s),
            (InputType::Confirmation, Value::Bool(_)) => true,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            InputType::Text => "text".to_string(),
            InputType::Choice { options } => format!("one of [{}]", options.join(", ")),
            InputType::Confirmation => "confirmation (true/false)".to_string(),
        }
    }
}

/// A pending request for human input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    /// Call the answer will be attributed to in the job history.
    pub call_id: String,
    pub prompt: String,
    pub input_type: InputType,
    /// Failure that caused an implicit escalation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl InterruptRequest {
    /// Build a request from a `request_human_input` invocation.
    pub fn from_invocation(invocation: &ToolInvocation) -> Result<Self, ToolError> {
        let args = &invocation.arguments;
        let prompt = args
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ToolError::recoverable("request_human_input requires a 'prompt'"))?;

        let input_type = match args.get("input_type").and_then(Value::as_str) {
            None | Some("text") => InputType::Text,
            Some("confirmation") => InputType::Confirmation,
            Some("choice") => {
                let options: Vec<String> = args
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if options.is_empty() {
                    return Err(ToolError::recoverable(
                        "input_type 'choice' requires a non-empty 'options' list",
                    ));
                }
                InputType::Choice { options }
            }
            Some(other) => {
                return Err(ToolError::recoverable(format!(
                    "unknown input_type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            call_id: invocation.call_id.clone(),
            prompt: prompt.to_string(),
            input_type,
            context: None,
        })
    }

    /// Implicit request raised when `what` keeps failing past the retry cap.
    pub fn escalation(call_id: &str, what: &str, attempts: u32, error: &ToolError) -> Self {
        let context = format!("{} failed {} times in a row: {}", what, attempts, error.message);
        Self {
            call_id: call_id.to_string(),
            prompt: format!(
                "{}. Please resolve the problem in the browser or describe how to proceed.",
                context
            ),
            input_type: InputType::Text,
            context: Some(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names_parse() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("click"), None);
    }

    #[test]
    fn test_input_type_accepts() {
        assert!(InputType::Text.accepts(&json!("123456")));
        assert!(!InputType::Text.accepts(&json!(123456)));
        assert!(InputType::Confirmation.accepts(&json!(true)));
        assert!(!InputType::Confirmation.accepts(&json!("yes")));

        let choice = InputType::Choice {
            options: vec!["sms".into(), "email".into()],
        };
        assert!(choice.accepts(&json!("email")));
        assert!(!choice.accepts(&json!("fax")));
    }

    #[test]
    fn test_interrupt_request_from_invocation() {
        let inv = ToolInvocation::new(
            ToolName::RequestHumanInput,
            json!({ "prompt": "Enter code" }),
        );
        let req = InterruptRequest::from_invocation(&inv).unwrap();
        assert_eq!(req.prompt, "Enter code");
        assert_eq!(req.input_type, InputType::Text);
        assert_eq!(req.call_id, inv.call_id);

        let missing = ToolInvocation::new(ToolName::RequestHumanInput, json!({}));
        assert!(InterruptRequest::from_invocation(&missing).is_err());

        let empty_choice = ToolInvocation::new(
            ToolName::RequestHumanInput,
            json!({ "prompt": "Pick", "input_type": "choice" }),
        );
        assert!(InterruptRequest::from_invocation(&empty_choice).is_err());
    }

    #[test]
    fn test_escalation_carries_failure_context() {
        let inv = ToolInvocation::new(ToolName::Navigate, json!({ "url": "https://a.test" }));
        let req = InterruptRequest::escalation(
            &inv.call_id,
            inv.tool.as_str(),
            4,
            &ToolError::recoverable("timeout"),
        );
        assert_eq!(
            req.context.as_deref(),
            Some("navigate failed 4 times in a row: timeout")
        );
        assert!(req.prompt.starts_with("navigate failed 4 times"));
        assert_eq!(req.call_id, inv.call_id);
    }

    #[test]
    fn test_describe_invocation() {
        let inv = ToolInvocation::new(ToolName::Navigate, json!({ "url": "https://a.test" }));
        assert_eq!(inv.describe(), "Navigating to https://a.test");
        let fill = ToolInvocation::new(ToolName::Fill, json!({ "fields": { "#a": "1", "#b": "2" } }));
        assert_eq!(fill.describe(), "Filling 2 form field(s)");
    }
}
