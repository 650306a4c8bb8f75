use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use parley_agent::{
    AgentEvent, ManualClock, Orchestrator, OrchestratorConfig, TurnContext, TurnState,
};
use parley_core::config::Config;
use parley_core::error::ParleyError;
use parley_core::session::{InMemoryTranscriptStore, SessionId, TranscriptStore};
use parley_core::types::{Decision, ProviderId, Role};
use parley_providers::transport::{Script, ScriptedTransport};
use parley_tools::document::DocumentStore;
use parley_tools::{HandlerOutput, ToolFailure, ToolHandler, ToolRegistry};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn frame(value: Value) -> String {
    format!("data: {value}\n\n")
}

/// A Chat Completions stream carrying plain text.
fn chat_text(text: &str) -> String {
    let mut body = frame(json!({"choices": [{"delta": {"content": text}}]}));
    body.push_str(&frame(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]})));
    body.push_str("data: [DONE]\n\n");
    body
}

/// A Chat Completions stream carrying one streamed call per entry.
fn chat_calls(calls: &[(&str, &str, Value)]) -> String {
    let mut body = String::new();
    for (index, (id, name, args)) in calls.iter().enumerate() {
        body.push_str(&frame(json!({"choices": [{"delta": {"tool_calls": [{
            "index": index,
            "id": id,
            "type": "function",
            "function": {"name": name, "arguments": ""}
        }]}}]})));
        body.push_str(&frame(json!({"choices": [{"delta": {"tool_calls": [{
            "index": index,
            "function": {"arguments": args.to_string()}
        }]}}]})));
    }
    body.push_str(&frame(
        json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
    ));
    body.push_str("data: [DONE]\n\n");
    body
}

/// Counts invocations and echoes its `city` argument.
#[derive(Default)]
struct Weather {
    calls: AtomicU32,
}

#[async_trait]
impl ToolHandler for Weather {
    fn name(&self) -> &str {
        "get_weather"
    }
    fn description(&self) -> &str {
        "Current weather for a city"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        })
    }
    async fn call(&self, arguments: Value) -> Result<HandlerOutput, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput::ok(json!({"city": arguments["city"], "sky": "clear"})))
    }
}

struct Harness {
    orch: Orchestrator,
    transport: Arc<ScriptedTransport>,
    transcripts: Arc<InMemoryTranscriptStore>,
    weather: Arc<Weather>,
    docs: DocumentStore,
}

fn config(provider: ProviderId) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::from_config(&Config::default(), provider);
    config.executor.base_backoff = Duration::from_millis(1);
    config
}

async fn harness_with(
    config: OrchestratorConfig,
    scripts: Vec<Script>,
    clock: Option<Arc<ManualClock>>,
) -> Harness {
    let transport = Arc::new(ScriptedTransport::new(scripts));
    let transcripts = Arc::new(InMemoryTranscriptStore::new());
    let weather = Arc::new(Weather::default());
    let docs = DocumentStore::new();
    docs.put("notes", "hello world\n").await;

    let mut tools = ToolRegistry::new();
    tools.register(weather.clone());
    docs.register_tools(&mut tools);

    let orch = match clock {
        Some(clock) => Orchestrator::with_clock(
            config,
            transport.clone(),
            tools,
            transcripts.clone(),
            Box::new(clock),
        ),
        None => Orchestrator::new(config, transport.clone(), tools, transcripts.clone()),
    };
    Harness {
        orch,
        transport,
        transcripts,
        weather,
        docs,
    }
}

async fn harness(scripts: Vec<Script>) -> Harness {
    harness_with(config(ProviderId::OpenAiChat), scripts, None).await
}

fn session() -> SessionId {
    SessionId::new("test-session")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A Gemini chunk with one unnamed function call per city.
fn gemini_calls(cities: &[&str]) -> String {
    let parts: Vec<Value> = cities
        .iter()
        .map(|city| json!({"functionCall": {"name": "get_weather", "args": {"city": city}}}))
        .collect();
    frame(json!({"candidates": [{
        "content": {"role": "model", "parts": parts},
        "finishReason": "STOP"
    }]}))
}

fn gemini_text(text: &str) -> String {
    frame(json!({"candidates": [{
        "content": {"role": "model", "parts": [{"text": text}]},
        "finishReason": "STOP"
    }]}))
}

/// A Mistral stream with whole calls that carry no id.
fn mistral_calls(cities: &[&str]) -> String {
    let calls: Vec<Value> = cities
        .iter()
        .map(|city| json!({"function": {"name": "get_weather", "arguments": json!({"city": city}).to_string()}}))
        .collect();
    let mut body = frame(json!({"choices": [{
        "delta": {"tool_calls": calls},
        "finish_reason": "tool_calls"
    }]}));
    body.push_str("data: [DONE]\n\n");
    body
}

fn replace_call(id: &str) -> (&str, &str, Value) {
    (
        id,
        "replace_content",
        json!({"document": "notes", "old_text": "world", "new_text": "there"}),
    )
}

// ---------------------------------------------------------------------------
// Golden path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tool_round_then_answer() {
    let h = harness(vec![
        Script::sse(chat_calls(&[("call_1", "get_weather", json!({"city": "Oslo"}))])),
        Script::sse(chat_text("Clear skies in Oslo.")),
    ])
    .await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = TurnContext::with_events(tx);

    let handle = h.orch.start_turn(&session(), "Weather in Oslo?", &ctx).await.unwrap();

    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(handle.reply, "Clear skies in Oslo.");
    assert_eq!(handle.iterations, 2);
    assert_eq!(handle.tool_results.len(), 1);
    assert!(handle.tool_results[0].success);
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        handle.transitions,
        vec![
            TurnState::Building,
            TurnState::Streaming,
            TurnState::Extracting,
            TurnState::Executing,
            TurnState::Continuing,
            TurnState::Streaming,
            TurnState::Extracting,
            TurnState::Done,
        ]
    );

    // The follow-up replays history: user, assistant tool call, tool result.
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    let messages = sent[1].body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_call_id"], "call_1");
    assert!(messages[2]["content"].as_str().unwrap().contains("clear"));

    let transcript = h.transcripts.load(&session()).await.unwrap();
    let roles: Vec<Role> = transcript.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert!(h.orch.continuations().store().is_empty());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolCall { name, .. } if name == "get_weather")));
    assert!(events.iter().any(|e| matches!(e, AgentEvent::TextDelta { text } if text == "Clear skies in Oslo.")));
}

#[tokio::test]
async fn test_finished_sessions_release_their_slot() {
    let h = harness(vec![
        Script::sse(chat_text("One.")),
        Script::sse(chat_text("Two.")),
        Script::Reject {
            status: 500,
            message: "boom".into(),
        },
    ])
    .await;
    let ctx = TurnContext::new();
    for name in ["a", "b"] {
        h.orch.start_turn(&SessionId::new(name), "hi", &ctx).await.unwrap();
    }
    assert!(h.orch.start_turn(&SessionId::new("c"), "hi", &ctx).await.is_err());
    assert!(h.orch.submit_decision(&SessionId::new("d"), "x", Decision::Accepted, &ctx).await.is_err());
    assert!(!h.orch.is_awaiting_decision(&SessionId::new("e")).await);

    assert_eq!(h.orch.active_sessions(), 0);
}

#[tokio::test]
async fn test_second_turn_sees_prior_transcript() {
    let h = harness(vec![
        Script::sse(chat_text("Hi.")),
        Script::sse(chat_text("Still here.")),
    ])
    .await;
    let ctx = TurnContext::new();
    h.orch.start_turn(&session(), "hello", &ctx).await.unwrap();
    h.orch.start_turn(&session(), "again", &ctx).await.unwrap();

    let sent = h.transport.sent();
    let messages = sent[1].body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["content"], "Hi.");
    assert_eq!(messages[2]["content"], "again");
}

#[tokio::test]
async fn test_handle_provider_resumes_by_response_id() {
    let stream = [
        frame(json!({"type": "response.created", "response": {"id": "resp_1"}})),
        frame(json!({"type": "response.output_item.added", "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "get_weather"
        }})),
        frame(json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"city\":\"Rome\"}"})),
        frame(json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "arguments": "{\"city\":\"Rome\"}"})),
        frame(json!({"type": "response.completed", "response": {"id": "resp_1", "output": []}})),
    ]
    .concat();
    let answer = [
        frame(json!({"type": "response.created", "response": {"id": "resp_2"}})),
        frame(json!({"type": "response.output_text.delta", "delta": "Sunny."})),
        frame(json!({"type": "response.completed", "response": {"id": "resp_2", "output": []}})),
    ]
    .concat();
    let h = harness_with(
        config(ProviderId::OpenAiResponses),
        vec![Script::sse(stream), Script::sse(answer)],
        None,
    )
    .await;

    let handle = h
        .orch
        .start_turn(&session(), "Rome?", &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::Done);

    let sent = h.transport.sent();
    assert_eq!(sent[1].body["previous_response_id"], "resp_1");
    let input = sent[1].body["input"].as_array().unwrap();
    assert_eq!(input.len(), 1);
    assert_eq!(input[0]["type"], "function_call_output");
    assert_eq!(input[0]["call_id"], "call_1");
}

#[tokio::test]
async fn test_terminal_payload_fallback_when_stream_has_no_call_events() {
    let stream = [
        frame(json!({"type": "response.created", "response": {"id": "resp_1"}})),
        frame(json!({"type": "response.completed", "response": {
            "id": "resp_1",
            "output": [{
                "type": "function_call",
                "call_id": "call_9",
                "name": "get_weather",
                "arguments": "{\"city\":\"Lima\"}"
            }]
        }})),
    ]
    .concat();
    let answer = [
        frame(json!({"type": "response.output_text.delta", "delta": "Warm."})),
        frame(json!({"type": "response.completed", "response": {"id": "resp_2", "output": []}})),
    ]
    .concat();
    let h = harness_with(
        config(ProviderId::OpenAiResponses),
        vec![Script::sse(stream), Script::sse(answer)],
        None,
    )
    .await;

    let handle = h
        .orch
        .start_turn(&session(), "Lima?", &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.tool_results[0].tool_call_id, "call_9");
}

#[tokio::test]
async fn test_gemini_calls_in_consecutive_rounds_all_run() {
    let h = harness_with(
        config(ProviderId::Gemini),
        vec![
            Script::sse(gemini_calls(&["Paris"])),
            Script::sse(gemini_calls(&["Rome"])),
            Script::sse(gemini_text("Clear in both.")),
        ],
        None,
    )
    .await;

    let handle = h
        .orch
        .start_turn(&session(), "Paris then Rome?", &TurnContext::new())
        .await
        .unwrap();

    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(handle.reply, "Clear in both.");
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.sent().len(), 3);
    let ids: Vec<&str> = handle.tool_results.iter().map(|r| r.tool_call_id.as_str()).collect();
    assert_eq!(ids, vec!["gemini_call_r1_1", "gemini_call_r2_1"]);
    let cities: Vec<&Value> = handle.tool_results.iter().map(|r| &r.payload["city"]).collect();
    assert_eq!(cities, vec!["Paris", "Rome"]);

    // The last request replays both rounds.
    let sent = h.transport.sent();
    let contents = sent[2].body["contents"].as_array().unwrap();
    let responses = contents
        .iter()
        .flat_map(|c| c["parts"].as_array().into_iter().flatten())
        .filter(|p| p.get("functionResponse").is_some())
        .count();
    assert_eq!(responses, 2);

    let transcript = h.transcripts.load(&session()).await.unwrap();
    assert_eq!(transcript.last().unwrap().content.as_deref(), Some("Clear in both."));
}

#[tokio::test]
async fn test_mistral_calls_without_ids_in_consecutive_rounds_all_run() {
    let h = harness_with(
        config(ProviderId::Mistral),
        vec![
            Script::sse(mistral_calls(&["Paris"])),
            Script::sse(mistral_calls(&["Rome"])),
            Script::sse(chat_text("Clear in both.")),
        ],
        None,
    )
    .await;

    let handle = h
        .orch
        .start_turn(&session(), "Paris then Rome?", &TurnContext::new())
        .await
        .unwrap();

    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(handle.reply, "Clear in both.");
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.sent().len(), 3);

    let sent = h.transport.sent();
    let tool_ids: Vec<&str> = sent[2].body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] == "tool")
        .filter_map(|m| m["tool_call_id"].as_str())
        .collect();
    assert_eq!(tool_ids, vec!["mistral_call_r1_1", "mistral_call_r2_1"]);
}

#[tokio::test]
async fn test_handle_provider_losing_response_id_replays_whole_turn() {
    let first = [
        frame(json!({"type": "response.created", "response": {"id": "resp_1"}})),
        frame(json!({"type": "response.output_item.added", "item": {
            "type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "get_weather"
        }})),
        frame(json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "arguments": "{\"city\":\"Rome\"}"})),
        frame(json!({"type": "response.completed", "response": {"id": "resp_1", "output": []}})),
    ]
    .concat();
    // No response.created and no id on completion.
    let second = [
        frame(json!({"type": "response.output_item.added", "item": {
            "type": "function_call", "id": "fc_2", "call_id": "call_2", "name": "get_weather"
        }})),
        frame(json!({"type": "response.function_call_arguments.done", "item_id": "fc_2", "arguments": "{\"city\":\"Oslo\"}"})),
        frame(json!({"type": "response.completed", "response": {"output": []}})),
    ]
    .concat();
    let answer = [
        frame(json!({"type": "response.output_text.delta", "delta": "Both sunny."})),
        frame(json!({"type": "response.completed", "response": {"id": "resp_3", "output": []}})),
    ]
    .concat();
    let h = harness_with(
        config(ProviderId::OpenAiResponses),
        vec![Script::sse(first), Script::sse(second), Script::sse(answer)],
        None,
    )
    .await;

    let handle = h
        .orch
        .start_turn(&session(), "Rome and Oslo?", &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 2);

    let sent = h.transport.sent();
    assert_eq!(sent[1].body["previous_response_id"], "resp_1");
    assert!(sent[2].body.get("previous_response_id").is_none());
    let input = sent[2].body["input"].as_array().unwrap();
    assert_eq!(input[0]["content"], "Rome and Oslo?");
    let outputs: Vec<&str> = input
        .iter()
        .filter(|i| i["type"] == "function_call_output")
        .filter_map(|i| i["call_id"].as_str())
        .collect();
    assert_eq!(outputs, vec!["call_1", "call_2"]);
}

// ---------------------------------------------------------------------------
// Tool failures and limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_call_does_not_stop_batch() {
    let h = harness(vec![
        Script::sse(chat_calls(&[
            ("call_1", "no_such_tool", json!({})),
            ("call_2", "get_weather", json!({"city": "Oslo"})),
        ])),
        Script::sse(chat_text("Partial answer.")),
    ])
    .await;

    let handle = h
        .orch
        .start_turn(&session(), "go", &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::Done);
    let outcome: Vec<(&str, bool)> = handle
        .tool_results
        .iter()
        .map(|r| (r.tool_call_id.as_str(), r.success))
        .collect();
    assert_eq!(outcome, vec![("call_1", false), ("call_2", true)]);

    // Both results go back to the model, failure included.
    let sent = h.transport.sent();
    let messages = sent[1].body["messages"].as_array().unwrap();
    let tool_ids: Vec<&str> = messages
        .iter()
        .filter(|m| m["role"] == "tool")
        .filter_map(|m| m["tool_call_id"].as_str())
        .collect();
    assert_eq!(tool_ids, vec!["call_1", "call_2"]);
    assert!(messages[2]["content"].as_str().unwrap().contains("not_found"));
}

#[tokio::test]
async fn test_call_repeated_across_rounds_runs_once() {
    let call = [("call_1", "get_weather", json!({"city": "Oslo"}))];
    let repeat = chat_calls(&call).replace("data: [DONE]", &format!(
        "{}data: [DONE]",
        frame(json!({"choices": [{"delta": {"content": "Done."}}]}))
    ));
    let h = harness(vec![Script::sse(chat_calls(&call)), Script::sse(repeat)]).await;

    let handle = h
        .orch
        .start_turn(&session(), "go", &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.tool_results.len(), 1);
    assert_eq!(h.transport.sent().len(), 2);
}

#[tokio::test]
async fn test_iteration_limit_fails_turn() {
    let mut cfg = config(ProviderId::OpenAiChat);
    cfg.max_tool_iterations = 1;
    let h = harness_with(
        cfg,
        vec![Script::sse(chat_calls(&[(
            "call_1",
            "get_weather",
            json!({"city": "Oslo"}),
        )]))],
        None,
    )
    .await;

    let err = h
        .orch
        .start_turn(&session(), "go", &TurnContext::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("iterations"));
    assert_eq!(h.transport.sent().len(), 1);
}

// ---------------------------------------------------------------------------
// Stream failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_malformed_arguments_fail_turn_without_persisting() {
    let mut body = frame(json!({"choices": [{"delta": {"tool_calls": [{
        "index": 0, "id": "call_1", "function": {"name": "get_weather", "arguments": "{\"city\": "}
    }]}}]}));
    body.push_str(&frame(
        json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
    ));
    let h = harness(vec![Script::sse(body)]).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = h
        .orch
        .start_turn(&session(), "go", &TurnContext::with_events(tx))
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Stream(_)));
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 0);
    assert!(h.transcripts.load(&session()).await.unwrap().is_empty());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Error { kind, .. } if kind == "stream")));
    assert!(events.iter().any(|e| matches!(e, AgentEvent::StateChanged { state: TurnState::Failed })));
}

#[tokio::test]
async fn test_provider_rejection_surfaces_as_error() {
    let h = harness(vec![Script::Reject {
        status: 429,
        message: "rate limited".into(),
    }])
    .await;
    let err = h
        .orch
        .start_turn(&session(), "go", &TurnContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Provider { status: 429, .. }));
}

#[tokio::test]
async fn test_stream_broken_midway() {
    let h = harness(vec![Script::Broken(
        vec![bytes::Bytes::from(frame(json!({"choices": [{"delta": {"content": "Hal"}}]})))],
        "connection reset".into(),
    )])
    .await;
    let err = h
        .orch
        .start_turn(&session(), "go", &TurnContext::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection reset"));
}

#[tokio::test]
async fn test_idle_stream_times_out() {
    let mut cfg = config(ProviderId::OpenAiChat);
    cfg.stream_idle_timeout = Duration::from_millis(50);
    let h = harness_with(
        cfg,
        vec![Script::Stall(vec![bytes::Bytes::from(frame(
            json!({"choices": [{"delta": {"content": "Thinking"}}]}),
        ))])],
        None,
    )
    .await;

    let err = h
        .orch
        .start_turn(&session(), "go", &TurnContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Stream(ref m) if m.contains("idle")));
}

#[tokio::test]
async fn test_cancel_during_stream() {
    let h = harness(vec![Script::Stall(Vec::new())]).await;
    let ctx = TurnContext::new();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let handle = h.orch.start_turn(&session(), "go", &ctx).await.unwrap();
    assert_eq!(handle.state, TurnState::Cancelled);
    assert!(h.transcripts.load(&session()).await.unwrap().is_empty());
    assert!(h.orch.continuations().store().is_empty());
}

// ---------------------------------------------------------------------------
// Human decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_gated_edit_accepted() {
    let h = harness(vec![
        Script::sse(chat_calls(&[replace_call("call_1")])),
        Script::sse(chat_text("Edited.")),
    ])
    .await;
    let ctx = TurnContext::new();

    let handle = h.orch.start_turn(&session(), "fix notes", &ctx).await.unwrap();
    assert_eq!(handle.state, TurnState::AwaitingDecision);
    assert_eq!(handle.pending.len(), 1);
    assert!(h.orch.is_awaiting_decision(&session()).await);
    assert_eq!(h.orch.active_sessions(), 1);
    assert_eq!(h.transport.sent().len(), 1);

    // A parked session refuses new turns.
    let busy = h.orch.start_turn(&session(), "other", &ctx).await.unwrap_err();
    assert!(matches!(busy, ParleyError::Session(_)));

    let proposal_id = handle.pending[0].payload["proposal_id"].as_str().unwrap();
    h.docs.commit(proposal_id).await.unwrap();
    let handle = h
        .orch
        .submit_decision(&session(), "call_1", Decision::Accepted, &ctx)
        .await
        .unwrap();

    assert_eq!(handle.state, TurnState::Done);
    assert!(handle.pending.is_empty());
    assert_eq!(h.docs.get("notes").await.unwrap(), "hello there\n");
    assert_eq!(handle.tool_results[0].payload, json!({"decision": "accepted"}));
    assert!(!h.orch.is_awaiting_decision(&session()).await);
    assert_eq!(h.orch.active_sessions(), 0);

    let sent = h.transport.sent();
    let messages = sent[1].body["messages"].as_array().unwrap();
    let tool = messages.last().unwrap();
    assert_eq!(tool["tool_call_id"], "call_1");
    assert!(tool["content"].as_str().unwrap().contains("accepted"));
}

#[tokio::test]
async fn test_gated_edit_rejected() {
    let h = harness(vec![
        Script::sse(chat_calls(&[replace_call("call_1")])),
        Script::sse(chat_text("Left it alone.")),
    ])
    .await;
    let ctx = TurnContext::new();

    let handle = h.orch.start_turn(&session(), "fix notes", &ctx).await.unwrap();
    let proposal_id = handle.pending[0].payload["proposal_id"].as_str().unwrap();
    h.docs.discard(proposal_id).await.unwrap();
    let handle = h
        .orch
        .submit_decision(&session(), "call_1", Decision::Rejected, &ctx)
        .await
        .unwrap();

    assert_eq!(handle.state, TurnState::Done);
    assert_eq!(h.docs.get("notes").await.unwrap(), "hello world\n");
    let sent = h.transport.sent();
    let tool = sent[1].body["messages"].as_array().unwrap().last().unwrap().clone();
    assert!(tool["content"].as_str().unwrap().contains("rejected"));
}

#[tokio::test]
async fn test_batch_waits_for_every_decision() {
    let h = harness(vec![
        Script::sse(chat_calls(&[
            replace_call("call_1"),
            ("call_2", "get_weather", json!({"city": "Oslo"})),
            (
                "call_3",
                "insert_content",
                json!({"document": "notes", "text": "bye\n"}),
            ),
        ])),
        Script::sse(chat_text("All set.")),
    ])
    .await;
    let ctx = TurnContext::new();

    let handle = h.orch.start_turn(&session(), "edit", &ctx).await.unwrap();
    let pending: Vec<&str> = handle.pending.iter().map(|r| r.tool_call_id.as_str()).collect();
    assert_eq!(pending, vec!["call_1", "call_3"]);

    let unknown = h
        .orch
        .submit_decision(&session(), "call_2", Decision::Accepted, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(unknown, ParleyError::Session(_)));

    let handle = h
        .orch
        .submit_decision(&session(), "call_3", Decision::Rejected, &ctx)
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::AwaitingDecision);
    assert_eq!(h.transport.sent().len(), 1);

    let handle = h
        .orch
        .submit_decision(&session(), "call_1", Decision::Accepted, &ctx)
        .await
        .unwrap();
    assert_eq!(handle.state, TurnState::Done);

    // Tool messages follow the original call order.
    let sent = h.transport.sent();
    let tool_ids: Vec<&str> = sent[1].body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] == "tool")
        .filter_map(|m| m["tool_call_id"].as_str())
        .collect();
    assert_eq!(tool_ids, vec!["call_1", "call_2", "call_3"]);
    assert_eq!(h.weather.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_decision_without_parked_turn() {
    let h = harness(Vec::new()).await;
    let err = h
        .orch
        .submit_decision(&session(), "call_1", Decision::Accepted, &TurnContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Session(_)));
}

#[tokio::test]
async fn test_expired_continuation_fails_decision() {
    let clock = Arc::new(ManualClock::default());
    let h = harness_with(
        config(ProviderId::OpenAiChat),
        vec![Script::sse(chat_calls(&[replace_call("call_1")]))],
        Some(clock.clone()),
    )
    .await;
    let ctx = TurnContext::new();

    h.orch.start_turn(&session(), "fix notes", &ctx).await.unwrap();
    clock.advance(Duration::from_secs(2 * 3600));

    let err = h
        .orch
        .submit_decision(&session(), "call_1", Decision::Accepted, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::ContinuationMissing { .. }));
    assert!(!h.orch.is_awaiting_decision(&session()).await);
    assert_eq!(h.transport.sent().len(), 1);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transcript_survives_restart_with_jsonl_store() {
    use parley_core::session_store::JsonlTranscriptStore;

    let dir = tempfile::tempdir().unwrap();
    let build = |scripts: Vec<Script>| {
        let transport = Arc::new(ScriptedTransport::new(scripts));
        let orch = Orchestrator::new(
            config(ProviderId::Anthropic),
            transport.clone(),
            ToolRegistry::new(),
            Arc::new(JsonlTranscriptStore::new(dir.path().to_path_buf())),
        );
        (orch, transport)
    };
    let anthropic_text = |text: &str| {
        [
            format!("event: message_start\n{}", frame(json!({"type": "message_start", "message": {"id": "msg_1"}}))),
            format!("event: content_block_delta\n{}", frame(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}))),
            format!("event: message_stop\n{}", frame(json!({"type": "message_stop"}))),
        ]
        .concat()
    };

    let (first, _) = build(vec![Script::sse(anthropic_text("Noted."))]);
    first
        .start_turn(&session(), "remember 42", &TurnContext::new())
        .await
        .unwrap();
    drop(first);

    let (second, transport) = build(vec![Script::sse(anthropic_text("42."))]);
    let handle = second
        .start_turn(&session(), "what number?", &TurnContext::new())
        .await
        .unwrap();
    assert_eq!(handle.reply, "42.");

    let sent = transport.sent();
    let messages = sent[0].body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}
