//! Mistral chat API adapter.
//!
//! Same chat dialect as OpenAI without `strict` tool schemas; tool
//! messages carry the tool name. Tool calls arrive whole in a single
//! streaming chunk rather than as argument deltas.

use serde_json::Value;

use parley_core::error::Result;
use parley_core::types::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, ProviderId, ToolCall, ToolSchema,
};

use crate::extract::{arguments_string, parse_arguments, synthetic_call_id};
use crate::openai_chat::{
    ChatDialect, chat_body, chat_extract, chat_from_wire, chat_messages, chat_tools, chat_usage,
    decode_chat_frame,
};
use crate::sse::SseFrame;
use crate::{
    ContinuationStyle, EventMapper, FrameSignal, HttpTarget, MappingRule, ProtocolAdapter,
    ProviderPayload, SignalKind, apply_rules,
};

const DEFAULT_BASE_URL: &str = "https://api.mistral.ai";

const DIALECT: ChatDialect = ChatDialect {
    provider: ProviderId::Mistral,
    strict_tools: false,
    tool_message_name: true,
};

const RULES: &[MappingRule] = &[
    MappingRule::new("done", SignalKind::End, ""),
    MappingRule::new("error", SignalKind::Error, "error.message"),
    MappingRule::new("chunk", SignalKind::Text, "choices.0.delta.content"),
];

pub struct MistralAdapter;

impl ProtocolAdapter for MistralAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Mistral
    }

    fn continuation_style(&self) -> ContinuationStyle {
        ContinuationStyle::History
    }

    fn default_base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
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
            body: chat_body(DIALECT, request, false),
        })
    }

    fn from_wire(&self, payload: &Value) -> Result<CanonicalResponse> {
        chat_from_wire(DIALECT, "mistral", payload)
    }

    fn extract_tool_calls(&self, payload: &Value) -> Vec<ToolCall> {
        chat_extract("mistral", payload)
    }

    fn event_mapper(&self) -> Box<dyn EventMapper> {
        Box::new(MistralMapper::default())
    }
}

#[derive(Default)]
struct MistralMapper {
    calls_seen: usize,
}

impl EventMapper for MistralMapper {
    fn map(&mut self, frame: &SseFrame) -> Vec<FrameSignal> {
        let Some((tag, chunk)) = decode_chat_frame(frame) else {
            return Vec::new();
        };
        let mut signals = apply_rules(RULES, tag, &chunk);
        if tag != "chunk" {
            return signals;
        }

        if let Some(calls) = chunk
            .pointer("/choices/0/delta/tool_calls")
            .and_then(Value::as_array)
        {
            for call in calls {
                let Some(name) = call.pointer("/function/name").and_then(Value::as_str) else {
                    continue;
                };
                self.calls_seen += 1;
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| synthetic_call_id("mistral", self.calls_seen));
                let arguments = parse_arguments(call.pointer("/function/arguments"));
                signals.push(FrameSignal::CallWhole {
                    id,
                    name: name.to_string(),
                    arguments: arguments_string(&arguments),
                });
            }
        }

        if let Some(usage) = chat_usage(&chunk) {
            signals.push(FrameSignal::Usage(usage));
        }
        signals
    }
}
