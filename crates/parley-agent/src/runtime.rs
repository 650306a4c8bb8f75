//! Agent turn loop: stream the model, execute tool calls, park for human
//! decisions, and resume through the continuation manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use parley_core::config::Config;
use parley_core::error::{ParleyError, Result};
use parley_core::session::{SessionId, TranscriptStore};
use parley_core::types::{
    CanonicalEvent, CanonicalMessage, CanonicalRequest, CanonicalResponse, Decision, ProviderId,
    ToolCall, ToolResult,
};
use parley_providers::transport::Transport;
use parley_providers::{AdapterRegistry, StreamParser, extract};
use parley_tools::{BatchStep, ExecutorPolicy, ToolExecutor, ToolRegistry};

use crate::continuation::{Clock, ContinuationManager, ContinuationStore, SystemClock};
use crate::{AgentEvent, TurnContext, TurnHandle, TurnState};

/// Per-orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub provider: ProviderId,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Stream rounds allowed per turn.
    pub max_tool_iterations: u32,
    /// Longest silence tolerated from the provider stream.
    pub stream_idle_timeout: Duration,
    pub continuation_ttl: Duration,
    pub executor: ExecutorPolicy,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config, provider: ProviderId) -> Self {
        Self {
            provider,
            model: config.model_for(provider),
            system_prompt: config.system_prompt(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            max_tool_iterations: config.max_tool_iterations(),
            stream_idle_timeout: config.provider_timeout(),
            continuation_ttl: config.continuation_ttl(),
            executor: ExecutorPolicy::from_config(config),
        }
    }
}

/// Everything one stream round produced.
#[derive(Debug, Default)]
struct StreamRound {
    text: String,
    calls: Vec<ToolCall>,
    response_id: Option<String>,
    saw_tool_events: bool,
    terminal: Option<Value>,
}

/// A turn in flight.
struct Turn {
    handle: TurnHandle,
    /// Transcript before this turn.
    prior: Vec<CanonicalMessage>,
    /// Messages this turn adds: user, assistant, tool.
    delta: Vec<CanonicalMessage>,
    /// Call ids already dispatched; a call never runs twice.
    executed: HashSet<String>,
}

impl Turn {
    fn transition(&mut self, state: TurnState, ctx: &TurnContext) {
        debug!(session = %self.handle.session_id, from = ?self.handle.state, to = ?state, "Turn transition");
        self.handle.state = state;
        self.handle.transitions.push(state);
        ctx.emit(AgentEvent::StateChanged { state });
    }
}

/// A turn suspended until every gated call has a decision.
struct ParkedTurn {
    turn: Turn,
    /// The whole batch, in call order; gated entries are replaced on decision.
    results: Vec<ToolResult>,
    decisions: HashMap<String, Decision>,
}

#[derive(Default)]
struct SessionSlot {
    parked: Option<ParkedTurn>,
}

enum Outcome {
    Done,
    Parked(Vec<ToolResult>),
    Cancelled,
}

/// Drives turns for any number of independent sessions.
pub struct Orchestrator {
    config: OrchestratorConfig,
    adapters: AdapterRegistry,
    transport: Arc<dyn Transport>,
    tools: ToolRegistry,
    executor: ToolExecutor,
    continuations: ContinuationManager,
    transcripts: Arc<dyn TranscriptStore>,
    sessions: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<SessionSlot>>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        tools: ToolRegistry,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> Self {
        Self::with_clock(config, transport, tools, transcripts, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        tools: ToolRegistry,
        transcripts: Arc<dyn TranscriptStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let adapters = AdapterRegistry::with_defaults();
        let continuations = ContinuationManager::new(
            ContinuationStore::new(config.continuation_ttl, clock),
            adapters.clone(),
        );
        Self {
            executor: ToolExecutor::new(config.executor),
            config,
            adapters,
            transport,
            tools,
            continuations,
            transcripts,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn continuations(&self) -> &ContinuationManager {
        &self.continuations
    }

    fn slot(&self, session: &SessionId) -> Arc<tokio::sync::Mutex<SessionSlot>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session.clone())
            .or_default()
            .clone()
    }

    /// Drop the session's slot once it holds no parked turn and no other
    /// caller is queued on it.
    fn release_if_idle(
        &self,
        session: &SessionId,
        slot: &Arc<tokio::sync::Mutex<SessionSlot>>,
        state: &SessionSlot,
    ) {
        if state.parked.is_some() {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        // The map's reference plus the caller's.
        if Arc::strong_count(slot) == 2 {
            sessions.remove(session);
        }
    }

    /// Sessions currently holding a slot: a parked turn or a turn in flight.
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `session` has a turn parked awaiting decisions.
    pub async fn is_awaiting_decision(&self, session: &SessionId) -> bool {
        let slot = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .cloned();
        match slot {
            Some(slot) => slot.lock().await.parked.is_some(),
            None => false,
        }
    }

    /// Run a new turn for `user_message` until it is done, cancelled or
    /// parked awaiting decisions.
    pub async fn start_turn(
        &self,
        session_id: &SessionId,
        user_message: &str,
        ctx: &TurnContext,
    ) -> Result<TurnHandle> {
        let slot = self.slot(session_id);
        let mut state = slot.lock().await;
        let result = self.run_turn(&mut state, session_id, user_message, ctx).await;
        self.release_if_idle(session_id, &slot, &state);
        result
    }

    /// Record a decision for one gated call. Once every gated call of the
    /// parked batch is decided the turn resumes.
    pub async fn submit_decision(
        &self,
        session_id: &SessionId,
        tool_call_id: &str,
        decision: Decision,
        ctx: &TurnContext,
    ) -> Result<TurnHandle> {
        let slot = self.slot(session_id);
        let mut state = slot.lock().await;
        let result = self.decide(&mut state, session_id, tool_call_id, decision, ctx).await;
        self.release_if_idle(session_id, &slot, &state);
        result
    }

    async fn run_turn(
        &self,
        slot: &mut SessionSlot,
        session_id: &SessionId,
        user_message: &str,
        ctx: &TurnContext,
    ) -> Result<TurnHandle> {
        if slot.parked.is_some() {
            return Err(ParleyError::Session(format!(
                "session '{session_id}' has a turn awaiting decisions"
            )));
        }

        let provider = self.config.provider;
        info!(session = %session_id, %provider, "Starting turn");

        let prior = self.transcripts.load(session_id).await?;
        let mut turn = Turn {
            handle: TurnHandle::new(session_id.clone(), provider),
            prior,
            delta: vec![CanonicalMessage::user(user_message)],
            executed: HashSet::new(),
        };
        ctx.emit(AgentEvent::StateChanged {
            state: TurnState::Building,
        });

        let mut messages = turn.prior.clone();
        messages.extend(turn.delta.iter().cloned());
        let request = self.build_request(messages);

        let outcome = self.drive(&mut turn, request, ctx).await;
        self.settle(slot, turn, outcome, ctx).await
    }

    async fn decide(
        &self,
        slot: &mut SessionSlot,
        session_id: &SessionId,
        tool_call_id: &str,
        decision: Decision,
        ctx: &TurnContext,
    ) -> Result<TurnHandle> {
        let Some(parked) = slot.parked.as_mut() else {
            return Err(ParleyError::Session(format!(
                "session '{session_id}' has no turn awaiting a decision"
            )));
        };
        if !parked.turn.handle.pending.iter().any(|r| r.tool_call_id == tool_call_id) {
            return Err(ParleyError::Session(format!(
                "tool call '{tool_call_id}' is not awaiting a decision"
            )));
        }

        info!(session = %session_id, tool_call_id, decision = decision.as_str(), "Decision received");
        parked.decisions.insert(tool_call_id.to_string(), decision);
        if parked.turn.handle.pending.iter().any(|r| !parked.decisions.contains_key(&r.tool_call_id)) {
            return Ok(parked.turn.handle.clone());
        }

        let Some(ParkedTurn {
            mut turn,
            mut results,
            decisions,
        }) = slot.parked.take()
        else {
            return Err(ParleyError::Session("parked turn vanished".into()));
        };

        // The underlying tool is never re-invoked: the decision is the result.
        for result in results.iter_mut() {
            if let Some(decision) = decisions.get(&result.tool_call_id) {
                result.payload = json!({ "decision": decision.as_str() });
                result.success = true;
                result.requires_confirmation = false;
            }
        }
        turn.handle.pending.clear();
        for recorded in turn.handle.tool_results.iter_mut() {
            if let Some(decided) = results
                .iter()
                .find(|r| r.tool_call_id == recorded.tool_call_id && decisions.contains_key(&r.tool_call_id))
            {
                *recorded = decided.clone();
            }
        }

        let outcome = match self.continue_with(&mut turn, &results, ctx) {
            Ok(request) => self.drive(&mut turn, request, ctx).await,
            Err(e) => Err(e),
        };
        self.settle(slot, turn, outcome, ctx).await
    }

    fn build_request(&self, messages: Vec<CanonicalMessage>) -> CanonicalRequest {
        let mut request = CanonicalRequest::new(self.config.model.clone(), messages);
        request.tools = self.tools.schemas();
        request.system_instruction = self.config.system_prompt.clone();
        request.max_tokens = self.config.max_tokens;
        request.temperature = self.config.temperature;
        request
    }

    /// Apply the outcome of a drive: persist, park or report failure.
    async fn settle(
        &self,
        slot: &mut SessionSlot,
        mut turn: Turn,
        outcome: Result<Outcome>,
        ctx: &TurnContext,
    ) -> Result<TurnHandle> {
        let session = turn.handle.session_id.clone();
        let provider = turn.handle.provider;

        match outcome {
            Ok(Outcome::Done) => {
                let mut transcript = std::mem::take(&mut turn.prior);
                transcript.append(&mut turn.delta);
                if let Err(e) = self.transcripts.save(&session, &transcript).await {
                    self.fail(&mut turn, &e, ctx);
                    return Err(e);
                }
                self.continuations.clear(&session, provider);
                info!(
                    session = %session,
                    iterations = turn.handle.iterations,
                    tool_calls = turn.handle.tool_results.len(),
                    "Turn complete"
                );
                Ok(turn.handle)
            }
            Ok(Outcome::Parked(results)) => {
                info!(session = %session, pending = turn.handle.pending.len(), "Turn awaiting decisions");
                let handle = turn.handle.clone();
                slot.parked = Some(ParkedTurn {
                    turn,
                    results,
                    decisions: HashMap::new(),
                });
                Ok(handle)
            }
            Ok(Outcome::Cancelled) => {
                info!(session = %session, "Turn cancelled");
                self.continuations.clear(&session, provider);
                turn.transition(TurnState::Cancelled, ctx);
                Ok(turn.handle)
            }
            Err(e) => {
                self.fail(&mut turn, &e, ctx);
                self.continuations.clear(&session, provider);
                Err(e)
            }
        }
    }

    fn fail(&self, turn: &mut Turn, e: &ParleyError, ctx: &TurnContext) {
        error!(session = %turn.handle.session_id, kind = e.kind(), error = %e, "Turn failed");
        turn.transition(TurnState::Failed, ctx);
        ctx.emit(AgentEvent::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        });
    }

    /// The state machine from STREAMING onwards.
    async fn drive(
        &self,
        turn: &mut Turn,
        mut request: CanonicalRequest,
        ctx: &TurnContext,
    ) -> Result<Outcome> {
        let session = turn.handle.session_id.clone();
        let provider = turn.handle.provider;

        loop {
            if turn.handle.iterations >= self.config.max_tool_iterations {
                return Err(ParleyError::Other(anyhow::anyhow!(
                    "turn exceeded {} tool iterations",
                    self.config.max_tool_iterations
                )));
            }
            turn.handle.iterations += 1;

            turn.transition(TurnState::Streaming, ctx);
            let Some(round) = self.stream_round(turn, &request, ctx).await? else {
                return Ok(Outcome::Cancelled);
            };

            turn.transition(TurnState::Extracting, ctx);
            let calls = self.collect_calls(turn, round.calls, round.saw_tool_events, round.terminal.as_ref());
            turn.handle.reply = round.text.clone();

            if calls.is_empty() {
                if !round.text.is_empty() {
                    turn.delta.push(CanonicalMessage::assistant(round.text));
                }
                turn.transition(TurnState::Done, ctx);
                return Ok(Outcome::Done);
            }

            let response = CanonicalResponse {
                content: Some(round.text).filter(|t| !t.is_empty()),
                tool_calls: calls,
                response_id: round.response_id,
                ..Default::default()
            };
            let history: Vec<CanonicalMessage> = turn.prior.iter().chain(&turn.delta).cloned().collect();
            self.continuations
                .remember(&session, provider, &request, &response, &history)?;
            turn.delta.push(response.assistant_message());

            turn.transition(TurnState::Executing, ctx);
            let Some(results) = self.execute_batch(turn, response.tool_calls, ctx).await else {
                return Ok(Outcome::Cancelled);
            };

            let gated: Vec<ToolResult> = results
                .iter()
                .filter(|r| r.requires_confirmation)
                .cloned()
                .collect();
            if !gated.is_empty() {
                turn.handle.pending = gated.clone();
                turn.transition(TurnState::AwaitingDecision, ctx);
                ctx.emit(AgentEvent::AwaitingDecision { pending: gated });
                return Ok(Outcome::Parked(results));
            }

            request = self.continue_with(turn, &results, ctx)?;
        }
    }

    /// CONTINUING: record tool messages and build the follow-up request.
    fn continue_with(
        &self,
        turn: &mut Turn,
        results: &[ToolResult],
        ctx: &TurnContext,
    ) -> Result<CanonicalRequest> {
        turn.transition(TurnState::Continuing, ctx);
        turn.delta
            .extend(results.iter().map(CanonicalMessage::tool_result));
        self.continuations
            .resume(&turn.handle.session_id, turn.handle.provider, results)
    }

    /// Streamed calls are authoritative; the terminal payload is only
    /// consulted when the stream carried no tool-call events at all.
    /// Synthetic ids are scoped to the round, so only provider-supplied
    /// ids can repeat across rounds.
    fn collect_calls(
        &self,
        turn: &Turn,
        streamed: Vec<ToolCall>,
        saw_tool_events: bool,
        terminal: Option<&Value>,
    ) -> Vec<ToolCall> {
        let mut calls = streamed;
        if !saw_tool_events {
            if let Some(payload) = terminal {
                if let Ok(adapter) = self.adapters.get(turn.handle.provider) {
                    let extracted =
                        extract::extract_for_round(adapter.as_ref(), payload, turn.handle.iterations);
                    if !extracted.is_empty() {
                        debug!(count = extracted.len(), "Tool calls recovered from terminal payload");
                    }
                    calls.extend(extracted);
                }
            }
        }

        let mut seen = HashSet::new();
        calls.retain(|call| {
            if turn.executed.contains(&call.id) {
                warn!(id = %call.id, "Tool call already executed in this turn, skipping");
                return false;
            }
            seen.insert(call.id.clone())
        });
        calls
    }

    /// EXECUTING: run the batch in call order. Returns `None` when the
    /// turn was cancelled; calls already dispatched still finish but
    /// their results are discarded.
    async fn execute_batch(
        &self,
        turn: &mut Turn,
        mut calls: Vec<ToolCall>,
        ctx: &TurnContext,
    ) -> Option<Vec<ToolResult>> {
        self.executor
            .execute_many(
                &mut calls,
                &self.tools,
                || ctx.cancel.is_cancelled(),
                |step| match step {
                    BatchStep::Dispatching(call) => {
                        turn.executed.insert(call.id.clone());
                        ctx.emit(AgentEvent::ToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        });
                    }
                    BatchStep::Finished(result) => {
                        ctx.emit(AgentEvent::ToolResult {
                            result: result.clone(),
                        });
                        turn.handle.tool_results.push(result.clone());
                    }
                },
            )
            .await
    }

    /// STREAMING: send the request and consume canonical events until the
    /// stream ends. Returns `None` on cancellation.
    async fn stream_round(
        &self,
        turn: &mut Turn,
        request: &CanonicalRequest,
        ctx: &TurnContext,
    ) -> Result<Option<StreamRound>> {
        let provider = turn.handle.provider;
        let adapter = self.adapters.get(provider)?;
        let payload = adapter.to_wire(request)?;
        let idle = self.config.stream_idle_timeout;
        debug!(%provider, model = %payload.model, messages = request.messages.len(), "Sending request");

        let opened = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(None),
            opened = tokio::time::timeout(idle, self.transport.open(adapter.as_ref(), &payload)) => opened,
        };
        let mut stream = opened.map_err(|_| {
            ParleyError::Stream(format!("{provider} did not respond within {}ms", idle.as_millis()))
        })??;

        let mut parser = StreamParser::for_round(adapter.as_ref(), turn.handle.iterations);
        let mut round = StreamRound::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(None),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };
            let (events, exhausted) = match next {
                Err(_) => {
                    return Err(ParleyError::Stream(format!(
                        "{provider} stream idle for {}ms",
                        idle.as_millis()
                    )));
                }
                Ok(Some(Ok(bytes))) => (parser.feed(&bytes), false),
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => (parser.finish(), true),
            };

            let mut ended = false;
            for event in events {
                match event {
                    CanonicalEvent::ResponseStarted { response_id } => {
                        round.response_id = Some(response_id);
                    }
                    CanonicalEvent::TextDelta { text } => {
                        round.text.push_str(&text);
                        ctx.emit(AgentEvent::TextDelta { text });
                    }
                    CanonicalEvent::ToolCallStart { id, name } => {
                        debug!(%id, %name, "Tool call streaming");
                    }
                    CanonicalEvent::ToolCallArgDelta { .. } => {}
                    CanonicalEvent::ToolCallComplete { id, name, arguments } => {
                        let arguments = serde_json::from_str(&arguments)?;
                        round.calls.push(ToolCall::new(id, name, arguments));
                    }
                    CanonicalEvent::Usage {
                        input_tokens,
                        output_tokens,
                    } => {
                        turn.handle.usage.input_tokens += input_tokens;
                        turn.handle.usage.output_tokens += output_tokens;
                        ctx.emit(AgentEvent::Usage {
                            input_tokens,
                            output_tokens,
                        });
                    }
                    CanonicalEvent::StreamEnd => ended = true,
                    CanonicalEvent::StreamError { message } => {
                        return Err(ParleyError::Stream(message));
                    }
                }
            }
            if ended || exhausted {
                break;
            }
        }

        round.saw_tool_events = parser.saw_tool_events();
        round.terminal = parser.terminal_payload().cloned();
        Ok(Some(round))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::session::InMemoryTranscriptStore;
    use parley_providers::transport::{Script, ScriptedTransport};

    fn orchestrator(transport: Arc<ScriptedTransport>) -> Orchestrator {
        let config = OrchestratorConfig::from_config(&Config::default(), ProviderId::OpenAiChat);
        Orchestrator::new(
            config,
            transport,
            ToolRegistry::new(),
            Arc::new(InMemoryTranscriptStore::new()),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::from_config(&Config::default(), ProviderId::Anthropic);
        assert_eq!(config.max_tool_iterations, 25);
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.executor, ExecutorPolicy::default());
        assert_eq!(config.model, "claude-sonnet-4-20250514");
    }

    #[tokio::test]
    async fn test_text_only_turn() {
        let transport = Arc::new(ScriptedTransport::new([Script::sse(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi there\"}}]}\n\ndata: [DONE]\n\n",
        )]));
        let orch = orchestrator(transport.clone());
        let handle = orch
            .start_turn(&SessionId::new("s"), "hello", &TurnContext::new())
            .await
            .unwrap();
        assert_eq!(handle.state, TurnState::Done);
        assert_eq!(handle.reply, "Hi there");
        assert_eq!(
            handle.transitions,
            vec![
                TurnState::Building,
                TurnState::Streaming,
                TurnState::Extracting,
                TurnState::Done
            ]
        );
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_turn_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let orch = orchestrator(transport.clone());
        let ctx = TurnContext::new();
        ctx.cancel.cancel();
        let handle = orch.start_turn(&SessionId::new("s"), "hello", &ctx).await.unwrap();
        assert_eq!(handle.state, TurnState::Cancelled);
        assert!(transport.sent().is_empty());
    }
}
