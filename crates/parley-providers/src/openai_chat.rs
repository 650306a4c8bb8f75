//! OpenAI Chat Completions API adapter.
//!
//! History-based continuation: the whole transcript is replayed on every
//! request. Assistant tool calls travel as a `tool_calls` array on the
//! assistant message, followed by one `role: tool` message per result.
//! The chat helpers here are shared with the Mistral adapter.

use serde_json::{Value, json};

use parley_core::error::Result;
use parley_core::types::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, ProviderId, Role, ToolCall, ToolSchema,
    Usage,
};

use crate::extract::{arguments_string, parse_arguments, synthetic_call_id};
use crate::sse::SseFrame;
use crate::{
    ContinuationStyle, EventMapper, FrameSignal, HttpTarget, MappingRule, ProtocolAdapter,
    ProviderPayload, SignalKind, apply_rules, collect_system, ensure_non_empty, provider_error,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiChatAdapter;

/// Options that differ between chat-style providers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChatDialect {
    pub provider: ProviderId,
    /// Emit `strict` (and `additionalProperties: false`) on tool schemas.
    pub strict_tools: bool,
    /// Tool messages carry the tool's `name`.
    pub tool_message_name: bool,
}

const DIALECT: ChatDialect = ChatDialect {
    provider: ProviderId::OpenAiChat,
    strict_tools: true,
    tool_message_name: false,
};

/// Event tags assigned to chat frames (the wire has none).
const RULES: &[MappingRule] = &[
    MappingRule::new("done", SignalKind::End, ""),
    MappingRule::new("error", SignalKind::Error, "error.message"),
    MappingRule::new("chunk", SignalKind::Text, "choices.0.delta.content"),
];

/// Decode a chat SSE frame into a tag and its JSON body.
pub(crate) fn decode_chat_frame(frame: &SseFrame) -> Option<(&'static str, Value)> {
    let data = frame.data.trim();
    if data == "[DONE]" {
        return Some(("done", Value::Null));
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::trace!(%e, data, "Failed to parse chat chunk");
            return None;
        }
    };
    if value.get("error").is_some_and(|e| !e.is_null()) {
        return Some(("error", value));
    }
    Some(("chunk", value))
}

pub(crate) fn chat_usage(chunk: &Value) -> Option<Usage> {
    let usage = chunk.get("usage").filter(|u| !u.is_null())?;
    Some(Usage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

pub(crate) fn chat_tools(dialect: ChatDialect, tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let mut function = json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            });
            if dialect.strict_tools {
                let strict = t.is_strict();
                function["strict"] = json!(strict);
                if strict && function["parameters"].is_object() {
                    function["parameters"]["additionalProperties"] = json!(false);
                }
            }
            json!({ "type": "function", "function": function })
        })
        .collect()
}

pub(crate) fn chat_messages(
    dialect: ChatDialect,
    system: Option<String>,
    transcript: &[CanonicalMessage],
) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = system {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for message in transcript {
        match message.role {
            // Folded into the leading system message.
            Role::System => {}
            Role::User => {
                messages.push(json!({
                    "role": "user",
                    "content": message.content.clone().unwrap_or_default(),
                }));
            }
            Role::Assistant => {
                let mut msg = json!({
                    "role": "assistant",
                    "content": message.content,
                });
                if !message.tool_calls.is_empty() {
                    let calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": arguments_string(&tc.arguments),
                                }
                            })
                        })
                        .collect();
                    msg["tool_calls"] = json!(calls);
                }
                messages.push(msg);
            }
            Role::Tool => {
                let mut msg = json!({
                    "role": "tool",
                    "tool_call_id": message.tool_call_id,
                    "content": message.content.clone().unwrap_or_default(),
                });
                if dialect.tool_message_name {
                    msg["name"] = json!(message.name);
                }
                messages.push(msg);
            }
        }
    }

    messages
}

pub(crate) fn chat_extract(prefix: &str, payload: &Value) -> Vec<ToolCall> {
    let Some(calls) = payload
        .pointer("/choices/0/message/tool_calls")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let function = call.get("function")?;
            let name = function.get("name").and_then(Value::as_str)?;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| synthetic_call_id(prefix, i + 1));
            Some(ToolCall::new(id, name, parse_arguments(function.get("arguments"))))
        })
        .collect()
}

pub(crate) fn chat_from_wire(
    dialect: ChatDialect,
    prefix: &str,
    payload: &Value,
) -> Result<CanonicalResponse> {
    if let Some(err) = provider_error(dialect.provider, payload) {
        return Err(err);
    }
    let choice = payload.pointer("/choices/0").ok_or_else(|| {
        parley_core::error::ParleyError::Protocol(format!(
            "{} response has no choices",
            dialect.provider
        ))
    })?;
    let response = CanonicalResponse {
        content: choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string),
        tool_calls: chat_extract(prefix, payload),
        response_id: payload.get("id").and_then(Value::as_str).map(str::to_string),
        stop_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: chat_usage(payload),
    };
    ensure_non_empty(dialect.provider, response)
}

pub(crate) fn chat_body(
    dialect: ChatDialect,
    request: &CanonicalRequest,
    include_usage: bool,
) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": chat_messages(dialect, collect_system(request), &request.messages),
        "max_tokens": request.max_tokens,
        "stream": true,
    });
    if include_usage {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(chat_tools(dialect, &request.tools));
    }
    body
}

impl ProtocolAdapter for OpenAiChatAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAiChat
    }

    fn continuation_style(&self) -> ContinuationStyle {
        ContinuationStyle::History
    }

    fn default_base_url(&self) -> &'static str {
        OPENAI_BASE_URL
    }

    fn http_target(&self, base_url: &str, _model: &str, api_key: &str) -> HttpTarget {
        HttpTarget {
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            headers: vec![("authorization".into(), format!("Bearer {api_key}"))],
        }
    }

    fn format_tools(&self, tools: &[ToolSchema]) -> Vec<Value> {
        chat_tools(DIALECT, tools)
    }

    fn format_messages(&self, messages: &[CanonicalMessage]) -> Vec<Value> {
        chat_messages(DIALECT, None, messages)
    }

    fn to_wire(&self, request: &CanonicalRequest) -> Result<ProviderPayload> {
        Ok(ProviderPayload {
            provider: self.id(),
            model: request.model.clone(),
            body: chat_body(DIALECT, request, true),
        })
    }

    fn from_wire(&self, payload: &Value) -> Result<CanonicalResponse> {
        chat_from_wire(DIALECT, "openai", payload)
    }

    fn extract_tool_calls(&self, payload: &Value) -> Vec<ToolCall> {
        chat_extract("openai", payload)
    }

    fn event_mapper(&self) -> Box<dyn EventMapper> {
        Box::new(ChatMapper)
    }
}

/// Chat Completions streams tool calls as index-keyed deltas.
struct ChatMapper;

impl EventMapper for ChatMapper {
    fn map(&mut self, frame: &SseFrame) -> Vec<FrameSignal> {
        let Some((tag, chunk)) = decode_chat_frame(frame) else {
            return Vec::new();
        };
        let mut signals = apply_rules(RULES, tag, &chunk);
        if tag != "chunk" {
            return signals;
        }

        if let Some(deltas) = chunk
            .pointer("/choices/0/delta/tool_calls")
            .and_then(Value::as_array)
        {
            for delta in deltas {
                let key = delta
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    .to_string();
                let id = delta.get("id").and_then(Value::as_str);
                let name = delta.pointer("/function/name").and_then(Value::as_str);
                if id.is_some() || name.is_some() {
                    signals.push(FrameSignal::CallStart {
                        key: key.clone(),
                        id: id.unwrap_or_default().to_string(),
                        name: name.unwrap_or_default().to_string(),
                    });
                }
                if let Some(args) = delta.pointer("/function/arguments").and_then(Value::as_str) {
                    signals.push(FrameSignal::CallArgs {
                        key,
                        fragment: args.to_string(),
                    });
                }
            }
        }

        if let Some(usage) = chat_usage(&chunk) {
            signals.push(FrameSignal::Usage(usage));
        }

        if chunk
            .pointer("/choices/0/finish_reason")
            .is_some_and(|r| !r.is_null())
        {
            signals.push(FrameSignal::CloseOpenCalls);
        }

        signals
    }
}
