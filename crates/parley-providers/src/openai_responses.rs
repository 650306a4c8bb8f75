//! OpenAI Responses API adapter.
//!
//! Handle-based continuation: responses are stored server-side and a
//! follow-up request names the previous response via
//! `previous_response_id`, sending only the new `function_call_output`
//! items. Replayed history uses role-less `function_call` /
//! `function_call_output` items.

use serde_json::{Value, json};

use parley_core::error::{ParleyError, Result};
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

pub struct OpenAiResponsesAdapter;

const RULES: &[MappingRule] = &[
    MappingRule::new("response.created", SignalKind::ResponseId, "response.id"),
    MappingRule::new("response.output_text.delta", SignalKind::Text, "delta"),
    MappingRule::new("response.completed", SignalKind::Terminal, "response"),
    MappingRule::new("response.completed", SignalKind::End, ""),
    MappingRule::new("response.incomplete", SignalKind::Terminal, "response"),
    MappingRule::new("response.incomplete", SignalKind::End, ""),
    MappingRule::new("response.failed", SignalKind::Error, "response.error.message"),
    MappingRule::new("error", SignalKind::Error, "message"),
];

fn responses_usage(response: &Value) -> Option<Usage> {
    let usage = response.get("usage").filter(|u| !u.is_null())?;
    Some(Usage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    })
}

impl ProtocolAdapter for OpenAiResponsesAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAiResponses
    }

    fn continuation_style(&self) -> ContinuationStyle {
        ContinuationStyle::Handle
    }

    fn default_base_url(&self) -> &'static str {
        OPENAI_BASE_URL
    }

    fn http_target(&self, base_url: &str, _model: &str, api_key: &str) -> HttpTarget {
        HttpTarget {
            url: format!("{}/v1/responses", base_url.trim_end_matches('/')),
            headers: vec![("authorization".into(), format!("Bearer {api_key}"))],
        }
    }

    fn format_tools(&self, tools: &[ToolSchema]) -> Vec<Value> {
        // Flat shape: no nested "function" object.
        tools
            .iter()
            .map(|t| {
                let strict = t.is_strict();
                let mut parameters = t.parameters.clone();
                if strict && parameters.is_object() {
                    parameters["additionalProperties"] = json!(false);
                }
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": parameters,
                    "strict": strict,
                })
            })
            .collect()
    }

    fn format_messages(&self, messages: &[CanonicalMessage]) -> Vec<Value> {
        let mut input = Vec::new();
        for message in messages {
            match message.role {
                Role::System => {}
                Role::User => input.push(json!({
                    "role": "user",
                    "content": message.content.clone().unwrap_or_default(),
                })),
                Role::Assistant => {
                    if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
                        input.push(json!({ "role": "assistant", "content": text }));
                    }
                    for tc in &message.tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": tc.id,
                            "name": tc.name,
                            "arguments": arguments_string(&tc.arguments),
                        }));
                    }
                }
                Role::Tool => input.push(json!({
                    "type": "function_call_output",
                    "call_id": message.tool_call_id,
                    "output": message.content.clone().unwrap_or_default(),
                })),
            }
        }
        input
    }

    fn to_wire(&self, request: &CanonicalRequest) -> Result<ProviderPayload> {
        let mut body = json!({
            "model": request.model,
            "input": self.format_messages(&request.messages),
            "max_output_tokens": request.max_tokens,
            "stream": true,
            "store": true,
        });
        if let Some(system) = collect_system(request) {
            body["instructions"] = json!(system);
        }
        if let Some(handle) = &request.resume_handle {
            body["previous_response_id"] = json!(handle);
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
        let output = payload
            .get("output")
            .and_then(Value::as_array)
            .ok_or_else(|| ParleyError::Protocol("responses payload has no output".into()))?;

        let text: String = output
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
            .filter_map(|item| item.get("content").and_then(Value::as_array))
            .flatten()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();

        let response = CanonicalResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: self.extract_tool_calls(payload),
            response_id: payload.get("id").and_then(Value::as_str).map(str::to_string),
            stop_reason: payload
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: responses_usage(payload),
        };
        ensure_non_empty(self.id(), response)
    }

    fn extract_tool_calls(&self, payload: &Value) -> Vec<ToolCall> {
        let Some(output) = payload.get("output").and_then(Value::as_array) else {
            return Vec::new();
        };
        output
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            .enumerate()
            .filter_map(|(i, item)| {
                let name = item.get("name").and_then(Value::as_str)?;
                let id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| synthetic_call_id("responses", i + 1));
                Some(ToolCall::new(id, name, parse_arguments(item.get("arguments"))))
            })
            .collect()
    }

    fn event_mapper(&self) -> Box<dyn EventMapper> {
        Box::new(ResponsesMapper)
    }
}

/// Function-call arguments are keyed by output item id, not call id.
struct ResponsesMapper;

fn function_call_item(data: &Value) -> Option<(&str, &str, &str)> {
    let item = data.get("item")?;
    if item.get("type").and_then(Value::as_str) != Some("function_call") {
        return None;
    }
    let item_id = item.get("id").and_then(Value::as_str).unwrap_or_default();
    let call_id = item.get("call_id").and_then(Value::as_str)?;
    let name = item.get("name").and_then(Value::as_str)?;
    Some((item_id, call_id, name))
}

impl EventMapper for ResponsesMapper {
    fn map(&mut self, frame: &SseFrame) -> Vec<FrameSignal> {
        let data: Value = match serde_json::from_str(frame.data.trim()) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(%e, "Failed to parse responses event");
                return Vec::new();
            }
        };
        let tag = frame
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        let mut signals = Vec::new();
        match tag.as_str() {
            "response.output_item.added" => {
                if let Some((item_id, call_id, name)) = function_call_item(&data) {
                    signals.push(FrameSignal::CallStart {
                        key: item_id.to_string(),
                        id: call_id.to_string(),
                        name: name.to_string(),
                    });
                }
            }
            "response.function_call_arguments.delta" => {
                if let (Some(key), Some(delta)) = (
                    data.get("item_id").and_then(Value::as_str),
                    data.get("delta").and_then(Value::as_str),
                ) {
                    signals.push(FrameSignal::CallArgs {
                        key: key.to_string(),
                        fragment: delta.to_string(),
                    });
                }
            }
            "response.function_call_arguments.done" => {
                if let Some(key) = data.get("item_id").and_then(Value::as_str) {
                    signals.push(FrameSignal::CallDone {
                        key: key.to_string(),
                        arguments: data
                            .get("arguments")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
            "response.output_item.done" => {
                if let Some((_, call_id, name)) = function_call_item(&data) {
                    let arguments = data
                        .pointer("/item/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    signals.push(FrameSignal::CallWhole {
                        id: call_id.to_string(),
                        name: name.to_string(),
                        arguments: arguments.to_string(),
                    });
                }
            }
            "response.completed" | "response.incomplete" => {
                if let Some(usage) = data.get("response").and_then(responses_usage) {
                    signals.push(FrameSignal::Usage(usage));
                }
            }
            _ => {}
        }
        signals.extend(apply_rules(RULES, &tag, &data));
        signals
    }
}
