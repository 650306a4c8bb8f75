//! LLM provider abstraction.
//!
//! Each provider implements the [`ProtocolAdapter`] trait, which translates
//! canonical requests into the provider's wire format and back, and supplies
//! an [`EventMapper`] that turns the provider's SSE frames into canonical
//! stream events via the [`parser::StreamParser`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_core::error::{ParleyError, Result};
use parley_core::types::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, ProviderId, ToolCall, ToolSchema, Usage,
};

pub mod anthropic;
pub mod extract;
pub mod gemini;
pub mod mistral;
pub mod openai_chat;
pub mod openai_responses;
pub mod parser;
pub mod sse;
pub mod transport;

pub use parser::StreamParser;
pub use sse::SseFrame;

/// How a provider resumes a conversation after tool results are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationStyle {
    /// The provider keeps state server-side; resume by response id.
    Handle,
    /// The client replays the whole transcript.
    History,
}

/// A rendered provider request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPayload {
    pub provider: ProviderId,
    pub model: String,
    pub body: Value,
}

/// Where and how to send a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpTarget {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Provider-specific signal decoded from one SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSignal {
    ResponseId(String),
    Text(String),
    /// A tool call begins; `key` is the provider's correlation key for its deltas.
    CallStart { key: String, id: String, name: String },
    CallArgs { key: String, fragment: String },
    /// A keyed call is finished; `arguments` overrides the accumulated buffer.
    CallDone { key: String, arguments: Option<String> },
    /// A complete call delivered in a single frame.
    CallWhole { id: String, name: String, arguments: String },
    /// Finish every call still open (e.g. on a finish reason).
    CloseOpenCalls,
    Usage(Usage),
    /// The provider's final full response body, kept for fallback extraction.
    Terminal(Value),
    End,
    Error(String),
}

/// Canonical kind a mapping rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    ResponseId,
    Text,
    Terminal,
    End,
    Error,
}

/// One row of a provider's event mapping table:
/// event tag → canonical kind, with a dotted JSON path to the payload.
#[derive(Debug, Clone, Copy)]
pub struct MappingRule {
    pub event: &'static str,
    pub kind: SignalKind,
    pub path: &'static str,
}

impl MappingRule {
    pub const fn new(event: &'static str, kind: SignalKind, path: &'static str) -> Self {
        Self { event, kind, path }
    }
}

/// Apply every rule matching `tag` to `data`. Rules whose path does not
/// resolve produce nothing.
pub fn apply_rules(rules: &[MappingRule], tag: &str, data: &Value) -> Vec<FrameSignal> {
    rules
        .iter()
        .filter(|r| r.event == tag)
        .filter_map(|r| {
            let target = json_path(data, r.path);
            match r.kind {
                SignalKind::End => Some(FrameSignal::End),
                SignalKind::Text => target
                    .and_then(Value::as_str)
                    .map(|s| FrameSignal::Text(s.to_string())),
                SignalKind::ResponseId => target
                    .and_then(Value::as_str)
                    .map(|s| FrameSignal::ResponseId(s.to_string())),
                SignalKind::Terminal => target.cloned().map(FrameSignal::Terminal),
                SignalKind::Error => Some(FrameSignal::Error(match target {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => data.to_string(),
                })),
            }
        })
        .collect()
}

/// Resolve a dotted path (`"a.b.0.c"`) inside a JSON value. Empty path is the value itself.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| {
        match segment.parse::<usize>() {
            Ok(index) if current.is_array() => current.get(index),
            _ => current.get(segment),
        }
    })
}

/// Per-stream translator from SSE frames to provider signals.
pub trait EventMapper: Send {
    /// Decode one complete frame. Unknown frames must yield no signals.
    fn map(&mut self, frame: &SseFrame) -> Vec<FrameSignal>;
}

/// Translates between the canonical model and one provider's HTTP API.
pub trait ProtocolAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    fn continuation_style(&self) -> ContinuationStyle;

    fn default_base_url(&self) -> &'static str;

    /// URL and auth headers for a streaming request.
    fn http_target(&self, base_url: &str, model: &str, api_key: &str) -> HttpTarget;

    /// Shape tool schemas for this provider's function-calling payload.
    fn format_tools(&self, tools: &[ToolSchema]) -> Vec<Value>;

    /// Render the transcript in this provider's message format.
    fn format_messages(&self, messages: &[CanonicalMessage]) -> Vec<Value>;

    /// Render a canonical request as a provider payload.
    fn to_wire(&self, request: &CanonicalRequest) -> Result<ProviderPayload>;

    /// Parse a complete (non-streaming) provider response.
    fn from_wire(&self, payload: &Value) -> Result<CanonicalResponse>;

    /// Pull completed tool calls out of a terminal response payload.
    /// Idempotent: same payload, same ids in the same order.
    fn extract_tool_calls(&self, payload: &Value) -> Vec<ToolCall>;

    /// Fresh frame mapper for one stream.
    fn event_mapper(&self) -> Box<dyn EventMapper>;
}

/// Lookup table of protocol adapters. Adding a provider means registering one here.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(openai_chat::OpenAiChatAdapter));
        registry.register(Arc::new(openai_responses::OpenAiResponsesAdapter));
        registry.register(Arc::new(anthropic::AnthropicAdapter));
        registry.register(Arc::new(gemini::GeminiAdapter));
        registry.register(Arc::new(mistral::MistralAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn get(&self, id: ProviderId) -> Result<Arc<dyn ProtocolAdapter>> {
        self.adapters
            .get(&id)
            .cloned()
            .ok_or_else(|| ParleyError::UnknownProvider(id.to_string()))
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.adapters.keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Surface an `error` object embedded in a provider response body.
pub(crate) fn provider_error(provider: ProviderId, body: &Value) -> Option<ParleyError> {
    let error = body.get("error").filter(|e| !e.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let status = error
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    Some(ParleyError::Provider {
        provider: provider.to_string(),
        status,
        message,
    })
}

/// Reject responses that carry neither text nor tool calls.
pub(crate) fn ensure_non_empty(
    provider: ProviderId,
    response: CanonicalResponse,
) -> Result<CanonicalResponse> {
    let has_text = response.content.as_deref().is_some_and(|c| !c.is_empty());
    if !has_text && response.tool_calls.is_empty() {
        return Err(ParleyError::Protocol(format!(
            "{provider} response has neither content nor tool calls"
        )));
    }
    Ok(response)
}

/// Join a system instruction with any `Role::System` messages in the transcript.
pub(crate) fn collect_system(request: &CanonicalRequest) -> Option<String> {
    use parley_core::types::Role;

    let mut parts: Vec<&str> = Vec::new();
    if let Some(sys) = request.system_instruction.as_deref() {
        parts.push(sys);
    }
    parts.extend(
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .filter_map(|m| m.content.as_deref()),
    );
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}
