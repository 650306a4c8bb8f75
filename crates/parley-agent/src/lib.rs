//! Agent runtime: drives one conversational turn across provider streams,
//! tool execution, human approval and continuation.
//!
//! [`Orchestrator::start_turn`] runs a turn until it is done, cancelled or
//! parked awaiting a decision; [`Orchestrator::submit_decision`] resumes a
//! parked turn. Progress is reported as [`AgentEvent`]s on the optional
//! channel in [`TurnContext`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_core::session::SessionId;
use parley_core::types::{ProviderId, ToolResult, Usage};

pub mod continuation;
pub mod runtime;

pub use continuation::{Clock, ContinuationManager, ContinuationStore, ManualClock, SystemClock};
pub use runtime::{Orchestrator, OrchestratorConfig};

/// Lifecycle states of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Building,
    Streaming,
    Extracting,
    Executing,
    AwaitingDecision,
    Continuing,
    Done,
    Failed,
    Cancelled,
}

impl TurnState {
    /// No further transitions happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Done | TurnState::Failed | TurnState::Cancelled)
    }
}

/// Events emitted by the orchestrator during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The turn moved to a new state.
    StateChanged { state: TurnState },

    /// Streaming text delta for live display.
    TextDelta { text: String },

    /// A tool call is about to run.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// A tool call has completed (successfully or not).
    ToolResult { result: ToolResult },

    /// Gated results waiting for a decision.
    AwaitingDecision { pending: Vec<ToolResult> },

    /// Token usage reported by the provider.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// The turn failed.
    Error { kind: String, message: String },
}

/// Caller-side plumbing for a turn.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub events: Option<mpsc::UnboundedSender<AgentEvent>>,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self {
            events: Some(events),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Snapshot of a turn returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnHandle {
    pub session_id: SessionId,
    pub provider: ProviderId,
    pub state: TurnState,
    /// Every state the turn has entered, in order.
    pub transitions: Vec<TurnState>,
    /// Assistant text of the most recent stream round.
    pub reply: String,
    /// Every tool result produced in this turn, in execution order.
    pub tool_results: Vec<ToolResult>,
    /// Gated results still awaiting a decision.
    pub pending: Vec<ToolResult>,
    pub usage: Usage,
    /// Provider stream rounds used so far.
    pub iterations: u32,
}

impl TurnHandle {
    pub(crate) fn new(session_id: SessionId, provider: ProviderId) -> Self {
        Self {
            session_id,
            provider,
            state: TurnState::Building,
            transitions: vec![TurnState::Building],
            reply: String::new(),
            tool_results: Vec::new(),
            pending: Vec::new(),
            usage: Usage::default(),
            iterations: 0,
        }
    }
}
