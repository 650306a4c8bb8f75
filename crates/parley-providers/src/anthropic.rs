//! Anthropic Messages API adapter.
//!
//! History-based continuation. The system prompt is a top-level field,
//! tool calls are `tool_use` content blocks on the assistant message and
//! results go back as `tool_result` blocks inside a user message.

use serde_json::{Value, json};

use parley_core::error::{ParleyError, Result};
use parley_core::types::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, ProviderId, Role, ToolCall, ToolSchema,
    Usage,
};

use crate::extract::{parse_arguments, synthetic_call_id};
use crate::sse::SseFrame;
use crate::{
    ContinuationStyle, EventMapper, FrameSignal, HttpTarget, MappingRule, ProtocolAdapter,
    ProviderPayload, SignalKind, apply_rules, collect_system, ensure_non_empty, provider_error,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

const RULES: &[MappingRule] = &[
    MappingRule::new("message_start", SignalKind::ResponseId, "message.id"),
    MappingRule::new("content_block_delta", SignalKind::Text, "delta.text"),
    MappingRule::new("message_stop", SignalKind::End, ""),
    MappingRule::new("error", SignalKind::Error, "error.message"),
];

impl ProtocolAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn continuation_style(&self) -> ContinuationStyle {
        ContinuationStyle::History
    }

    fn default_base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
    }

    fn http_target(&self, base_url: &str, _model: &str, api_key: &str) -> HttpTarget {
        HttpTarget {
            url: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            headers: vec![
                ("x-api-key".into(), api_key.to_string()),
                ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
            ],
        }
    }

    fn format_tools(&self, tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect()
    }

    fn format_messages(&self, transcript: &[CanonicalMessage]) -> Vec<Value> {
        let mut messages: Vec<Value> = Vec::new();

        for message in transcript {
            match message.role {
                Role::System => {}
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": message.content.clone().unwrap_or_default(),
                })),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    for tc in &message.tool_calls {
                        let input = if tc.arguments.is_object() {
                            tc.arguments.clone()
                        } else {
                            json!({})
                        };
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": input,
                        }));
                    }
                    if !blocks.is_empty() {
                        messages.push(json!({ "role": "assistant", "content": blocks }));
                    }
                }
                Role::Tool => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id,
                        "content": message.content.clone().unwrap_or_default(),
                    });
                    // Consecutive results share one user message.
                    let extend_previous = messages.last().is_some_and(|m| {
                        m["role"] == "user"
                            && m["content"]
                                .as_array()
                                .is_some_and(|c| c.iter().all(|b| b["type"] == "tool_result"))
                    });
                    if extend_previous {
                        if let Some(content) = messages
                            .last_mut()
                            .and_then(|m| m["content"].as_array_mut())
                        {
                            content.push(block);
                        }
                    } else {
                        messages.push(json!({ "role": "user", "content": [block] }));
                    }
                }
            }
        }

        messages
    }

    fn to_wire(&self, request: &CanonicalRequest) -> Result<ProviderPayload> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": self.format_messages(&request.messages),
            "stream": true,
        });
        if let Some(system) = collect_system(request) {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(self.format_tools(&request.tools));
        }
        Ok(ProviderPayload {
            provider: self.id(),
            model: request.model.clone(),
            body,
        })
    }

    fn from_wire(&self, payload: &Value) -> Result<CanonicalResponse> {
        if let Some(err) = provider_error(self.id(), payload) {
            return Err(err);
        }
        let blocks = payload
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ParleyError::Protocol("anthropic payload has no content".into()))?;
        let text: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect();
        let usage = payload.get("usage").map(|u| Usage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
        });

        let response = CanonicalResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: self.extract_tool_calls(payload),
            response_id: payload.get("id").and_then(Value::as_str).map(str::to_string),
            stop_reason: payload
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage,
        };
        ensure_non_empty(self.id(), response)
    }

    fn extract_tool_calls(&self, payload: &Value) -> Vec<ToolCall> {
        let Some(blocks) = payload.get("content").and_then(Value::as_array) else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|b| b["type"] == "tool_use")
            .enumerate()
            .filter_map(|(i, b)| {
                let name = b["name"].as_str()?;
                let id = b["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| synthetic_call_id("anthropic", i + 1));
                Some(ToolCall::new(id, name, parse_arguments(b.get("input"))))
            })
            .collect()
    }

    fn event_mapper(&self) -> Box<dyn EventMapper> {
        Box::new(AnthropicMapper)
    }
}

/// Tool input arrives as `input_json_delta` fragments keyed by content-block index.
struct AnthropicMapper;

impl EventMapper for AnthropicMapper {
    fn map(&mut self, frame: &SseFrame) -> Vec<FrameSignal> {
        let data: Value = match serde_json::from_str(frame.data.trim()) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(%e, "Failed to parse anthropic event");
                return Vec::new();
            }
        };
        let tag = frame
            .event
            .clone()
            .or_else(|| data["type"].as_str().map(str::to_string))
            .unwrap_or_default();
        let key = data["index"].as_u64().unwrap_or(0).to_string();

        let mut signals = apply_rules(RULES, &tag, &data);
        match tag.as_str() {
            "message_start" => {
                if let Some(input) = data.pointer("/message/usage/input_tokens").and_then(Value::as_u64) {
                    signals.push(FrameSignal::Usage(Usage {
                        input_tokens: input,
                        output_tokens: 0,
                    }));
                }
            }
            "content_block_start" => {
                let block = &data["content_block"];
                if block["type"] == "tool_use" {
                    signals.push(FrameSignal::CallStart {
                        key,
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    });
                }
            }
            "content_block_delta" => {
                if data["delta"]["type"] == "input_json_delta" {
                    signals.push(FrameSignal::CallArgs {
                        key,
                        fragment: data["delta"]["partial_json"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            "content_block_stop" => {
                signals.push(FrameSignal::CallDone {
                    key,
                    arguments: None,
                });
            }
            "message_delta" => {
                if let Some(output) = data.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    signals.push(FrameSignal::Usage(Usage {
                        input_tokens: 0,
                        output_tokens: output,
                    }));
                }
            }
            _ => {}
        }
        signals
    }
}
