//! Canonical, provider-independent conversation model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParleyError;

/// Supported LLM wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    OpenAiChat,
    OpenAiResponses,
    Anthropic,
    Gemini,
    Mistral,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::OpenAiChat,
        ProviderId::OpenAiResponses,
        ProviderId::Anthropic,
        ProviderId::Gemini,
        ProviderId::Mistral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAiChat => "openai_chat",
            ProviderId::OpenAiResponses => "openai_responses",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
            ProviderId::Mistral => "mistral",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ParleyError::UnknownProvider(s.to_string()))
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call as recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry of the conversation transcript. Order is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,
    /// Set on `Role::Tool` messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `Role::Tool` messages: the name of the tool that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CanonicalMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message carrying tool calls (and optional leading text).
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.filter(|c| !c.is_empty()),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool message reporting the result of one call.
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: Some(result.payload_text()),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.tool_call_id.clone()),
            name: Some(result.name.clone()),
        }
    }
}

/// Declarative tool description, sent to the model and used for validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    /// Field names listed in the schema's `required` array.
    pub fn required_fields(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// True when every declared property is required.
    pub fn is_strict(&self) -> bool {
        let required = self.required_fields();
        match self.parameters.get("properties").and_then(Value::as_object) {
            Some(props) => props.keys().all(|k| required.contains(&k.as_str())),
            None => true,
        }
    }
}

/// Provider-independent request for one model round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Server-side handle of the response this request continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_handle: Option<String>,
}

impl CanonicalRequest {
    pub fn new(model: impl Into<String>, messages: Vec<CanonicalMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            system_instruction: None,
            max_tokens: 4096,
            temperature: None,
            resume_handle: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Provider-independent view of a complete model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CanonicalResponse {
    /// The assistant message this response contributes to the transcript.
    pub fn assistant_message(&self) -> CanonicalMessage {
        CanonicalMessage::assistant_tool_calls(
            self.content.clone(),
            self.tool_calls.iter().map(ToolCall::to_ref).collect(),
        )
    }
}

/// Canonical stream event produced by the streaming parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    ResponseStarted { response_id: String },
    TextDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallArgDelta { id: String, fragment: String },
    ToolCallComplete { id: String, name: String, arguments: String },
    Usage { input_tokens: u64, output_tokens: u64 },
    StreamEnd,
    StreamError { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default)]
    pub status: ToolCallStatus,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
        }
    }

    pub fn to_ref(&self) -> ToolCallRef {
        ToolCallRef {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Outcome of one tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub success: bool,
    pub payload: Value,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ToolResult {
    /// Payload rendered as the text body of a tool message.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Human decision on a confirmation-gated tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::Rejected => "rejected",
        }
    }
}

impl FromStr for Decision {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accepted" | "accept" | "yes" | "y" => Ok(Decision::Accepted),
            "rejected" | "reject" | "no" | "n" => Ok(Decision::Rejected),
            other => Err(ParleyError::Session(format!("unknown decision: {other}"))),
        }
    }
}

/// Provider-specific resume state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContinuationContext {
    /// The provider keeps conversation state server-side.
    Handle(String),
    /// The client must replay this transcript.
    History(Vec<CanonicalMessage>),
}
