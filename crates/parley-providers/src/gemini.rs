//! Google Generative AI (Gemini) adapter.
//!
//! Streams via `streamGenerateContent?alt=sse`. Function calls arrive whole
//! inside a candidate's parts; the API does not name them, so ids are
//! positional (`gemini_call_1`, ...) and identical between the stream and
//! the terminal-payload extraction. Multi-response turns scope them per
//! round (`gemini_call_r2_1`).

use serde::Deserialize;
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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const RULES: &[MappingRule] = &[
    MappingRule::new("chunk", SignalKind::ResponseId, "responseId"),
    MappingRule::new("error", SignalKind::Error, "error.message"),
];

pub struct GeminiAdapter;

// --- Gemini response types ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCallPart>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallPart {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl From<&UsageMetadata> for Usage {
    fn from(meta: &UsageMetadata) -> Self {
        Usage {
            input_tokens: meta.prompt_token_count,
            output_tokens: meta.candidates_token_count,
        }
    }
}

impl GeminiChunk {
    fn parts(&self) -> impl Iterator<Item = &GeminiPart> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
    }

    fn finish_reason(&self) -> Option<&str> {
        self.candidates
            .iter()
            .find_map(|c| c.finish_reason.as_deref())
    }
}

/// Canonical call for the `position`-th (1-based) function call of a response.
fn to_tool_call(call: &FunctionCallPart, position: usize) -> ToolCall {
    let id = call
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| synthetic_call_id("gemini", position));
    ToolCall::new(id, call.name.clone(), parse_arguments(call.args.as_ref()))
}

impl ProtocolAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn continuation_style(&self) -> ContinuationStyle {
        ContinuationStyle::History
    }

    fn default_base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
    }

    fn http_target(&self, base_url: &str, model: &str, api_key: &str) -> HttpTarget {
        HttpTarget {
            url: format!(
                "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
                base_url.trim_end_matches('/')
            ),
            headers: vec![("x-goog-api-key".into(), api_key.to_string())],
        }
    }

    fn format_tools(&self, tools: &[ToolSchema]) -> Vec<Value> {
        // One tool object wrapping every declaration.
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        vec![json!({ "functionDeclarations": declarations })]
    }

    fn format_messages(&self, transcript: &[CanonicalMessage]) -> Vec<Value> {
        let mut contents: Vec<Value> = Vec::new();

        for message in transcript {
            match message.role {
                Role::System => {}
                Role::User => {
                    if let Some(text) = message.content.as_deref() {
                        contents.push(json!({ "role": "user", "parts": [{ "text": text }] }));
                    }
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
                        parts.push(json!({ "text": text }));
                    }
                    for tc in &message.tool_calls {
                        parts.push(json!({
                            "functionCall": { "name": tc.name, "args": tc.arguments }
                        }));
                    }
                    if !parts.is_empty() {
                        contents.push(json!({ "role": "model", "parts": parts }));
                    }
                }
                Role::Tool => {
                    let part = json!({
                        "functionResponse": {
                            "name": message.name,
                            "response": { "content": message.content.clone().unwrap_or_default() }
                        }
                    });
                    let extend_previous = contents.last().is_some_and(|c| {
                        c["role"] == "user"
                            && c["parts"]
                                .as_array()
                                .is_some_and(|p| p.iter().all(|p| p.get("functionResponse").is_some()))
                    });
                    if extend_previous {
                        if let Some(parts) = contents.last_mut().and_then(|c| c["parts"].as_array_mut()) {
                            parts.push(part);
                        }
                    } else {
                        contents.push(json!({ "role": "user", "parts": [part] }));
                    }
                }
            }
        }

        contents
    }

    fn to_wire(&self, request: &CanonicalRequest) -> Result<ProviderPayload> {
        let mut generation_config = json!({ "maxOutputTokens": request.max_tokens });
        if let Some(t) = request.temperature {
            generation_config["temperature"] = json!(t);
        }
        let mut body = json!({
            "contents": self.format_messages(&request.messages),
            "generationConfig": generation_config,
        });
        if let Some(system) = collect_system(request) {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
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
        let chunk: GeminiChunk = serde_json::from_value(payload.clone())
            .map_err(|e| ParleyError::Protocol(format!("gemini payload: {e}")))?;
        if chunk.candidates.is_empty() {
            return Err(ParleyError::Protocol("gemini response has no candidates".into()));
        }
        let text: String = chunk.parts().filter_map(|p| p.text.as_deref()).collect();

        let response = CanonicalResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: self.extract_tool_calls(payload),
            response_id: payload
                .get("responseId")
                .and_then(Value::as_str)
                .map(str::to_string),
            stop_reason: chunk.finish_reason().map(str::to_string),
            usage: chunk.usage_metadata.as_ref().map(Usage::from),
        };
        ensure_non_empty(self.id(), response)
    }

    fn extract_tool_calls(&self, payload: &Value) -> Vec<ToolCall> {
        let chunk: GeminiChunk = serde_json::from_value(payload.clone()).unwrap_or_default();
        chunk
            .parts()
            .filter_map(|p| p.function_call.as_ref())
            .enumerate()
            .map(|(i, call)| to_tool_call(call, i + 1))
            .collect()
    }

    fn event_mapper(&self) -> Box<dyn EventMapper> {
        Box::new(GeminiMapper::default())
    }
}

/// Numbers function calls across the whole stream so ids match extraction
/// over the aggregated response.
#[derive(Default)]
struct GeminiMapper {
    calls_seen: usize,
}

impl EventMapper for GeminiMapper {
    fn map(&mut self, frame: &SseFrame) -> Vec<FrameSignal> {
        let data: Value = match serde_json::from_str(frame.data.trim()) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(%e, "Failed to parse Gemini chunk");
                return Vec::new();
            }
        };
        if data.get("error").is_some_and(|e| !e.is_null()) {
            return apply_rules(RULES, "error", &data);
        }

        let mut signals = apply_rules(RULES, "chunk", &data);
        let chunk: GeminiChunk = match serde_json::from_value(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::trace!(%e, "Unrecognized Gemini chunk shape");
                return signals;
            }
        };

        for part in chunk.parts() {
            if let Some(text) = &part.text {
                signals.push(FrameSignal::Text(text.clone()));
            }
            if let Some(call) = &part.function_call {
                self.calls_seen += 1;
                let call = to_tool_call(call, self.calls_seen);
                signals.push(FrameSignal::CallWhole {
                    arguments: arguments_string(&call.arguments),
                    id: call.id,
                    name: call.name,
                });
            }
        }

        if let Some(meta) = &chunk.usage_metadata {
            signals.push(FrameSignal::Usage(meta.into()));
        }
        if chunk.finish_reason().is_some() {
            signals.push(FrameSignal::End);
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::StreamParser;
    use parley_core::types::{CanonicalEvent, ToolCallRef, ToolResult};

    #[test]
    fn test_http_target_uses_header_key() {
        let target = GeminiAdapter.http_target(DEFAULT_BASE_URL, "gemini-2.0-flash", "k");
        assert!(target.url.ends_with("/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"));
        assert!(!target.url.contains("key="));
        assert_eq!(target.headers, vec![("x-goog-api-key".to_string(), "k".to_string())]);
    }

    #[test]
    fn test_to_wire_shapes() {
        let mut request = CanonicalRequest::new(
            "gemini-2.0-flash",
            vec![
                CanonicalMessage::user("hi"),
                CanonicalMessage::assistant_tool_calls(
                    None,
                    vec![ToolCallRef {
                        id: "gemini_call_1".into(),
                        name: "lookup_value".into(),
                        arguments: json!({"key": "a"}),
                    }],
                ),
                CanonicalMessage::tool_result(&ToolResult {
                    tool_call_id: "gemini_call_1".into(),
                    name: "lookup_value".into(),
                    success: true,
                    payload: json!("1"),
                    requires_confirmation: false,
                    attempts: 1,
                    elapsed_ms: 0,
                }),
            ],
        );
        request.system_instruction = Some("be brief".into());
        request.tools = vec![ToolSchema {
            name: "lookup_value".into(),
            description: "Look up".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = GeminiAdapter.to_wire(&request).unwrap().body;

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "lookup_value");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["key"], "a");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "lookup_value");
    }

    #[test]
    fn test_stream_ids_match_extraction() {
        let chunk = json!({
            "responseId": "resp-g",
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup_value", "args": {"key": "a"}}},
                    {"functionCall": {"name": "lookup_value"}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}
        });
        let mut parser = StreamParser::for_adapter(&GeminiAdapter);
        let events = parser.feed(format!("data: {chunk}\n\n").as_bytes());

        assert_eq!(events[0], CanonicalEvent::ResponseStarted { response_id: "resp-g".into() });
        assert!(events.contains(&CanonicalEvent::ToolCallComplete {
            id: "gemini_call_2".into(),
            name: "lookup_value".into(),
            arguments: "{}".into(),
        }));
        assert_eq!(events.last(), Some(&CanonicalEvent::StreamEnd));

        let extracted = GeminiAdapter.extract_tool_calls(&chunk);
        assert_eq!(extracted[0].id, "gemini_call_1");
        assert_eq!(extracted[1].id, "gemini_call_2");
        assert_eq!(extracted[1].arguments, json!({}));
    }

    #[test]
    fn test_round_scoped_ids_differ_between_rounds() {
        let chunk = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup_value", "args": {"key": "a"}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let frame = format!("data: {chunk}\n\n");
        let complete_id = |round: u32| {
            StreamParser::for_round(&GeminiAdapter, round)
                .feed(frame.as_bytes())
                .into_iter()
                .find_map(|e| match e {
                    CanonicalEvent::ToolCallComplete { id, .. } => Some(id),
                    _ => None,
                })
        };

        assert_eq!(complete_id(1).as_deref(), Some("gemini_call_r1_1"));
        assert_eq!(complete_id(2).as_deref(), Some("gemini_call_r2_1"));
        let extracted = crate::extract::extract_for_round(&GeminiAdapter, &chunk, 2);
        assert_eq!(extracted[0].id, "gemini_call_r2_1");
    }

    #[test]
    fn test_provider_supplied_id_is_kept_across_rounds() {
        let chunk = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"id": "fc-7", "name": "lookup_value", "args": {}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let events = StreamParser::for_round(&GeminiAdapter, 3).feed(format!("data: {chunk}\n\n").as_bytes());
        assert!(events.contains(&CanonicalEvent::ToolCallStart {
            id: "fc-7".into(),
            name: "lookup_value".into(),
        }));
    }

    #[test]
    fn test_text_across_chunks() {
        let mut parser = StreamParser::for_adapter(&GeminiAdapter);
        let mut events = parser.feed(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
        );
        events.extend(parser.feed(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
        ));
        assert_eq!(
            events,
            vec![
                CanonicalEvent::TextDelta { text: "Hel".into() },
                CanonicalEvent::TextDelta { text: "lo".into() },
                CanonicalEvent::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_error_chunk() {
        let mut parser = StreamParser::for_adapter(&GeminiAdapter);
        let events = parser.feed(b"data: {\"error\":{\"code\":429,\"message\":\"quota\"}}\n\n");
        assert_eq!(events, vec![CanonicalEvent::StreamError { message: "quota".into() }]);
        assert!(GeminiAdapter
            .from_wire(&json!({"error": {"code": 429, "message": "quota"}}))
            .is_err());
    }
}
