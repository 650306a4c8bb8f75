//! Tool registry and execution for the agent runtime.
//!
//! Tools are capabilities exposed to the model during a turn. Each tool
//! implements the [`ToolHandler`] trait and is registered by the embedding
//! application; the orchestrator only ever sees names, schemas and results.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use parley_core::types::ToolSchema;

pub mod document;
pub mod executor;

pub use executor::{BatchStep, ExecutorPolicy, ToolExecutor};

/// Successful handler output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub success: bool,
    pub payload: Value,
    /// The output is a proposal that a human must accept before it takes effect.
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl HandlerOutput {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            requires_confirmation: false,
        }
    }

    /// A proposed change awaiting a human decision.
    pub fn proposal(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            requires_confirmation: true,
        }
    }

    /// The handler ran but reports a domain-level failure (not retried).
    pub fn failed(payload: Value) -> Self {
        Self {
            success: false,
            payload,
            requires_confirmation: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Terminal,
}

/// A handler error, classified for the executor's retry policy.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

static TRANSIENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timeout|timed out|connection|unavailable|temporarily|rate limit|\b429\b|\b502\b|\b503\b|\b504\b)",
    )
    .ok()
});

impl ToolFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    /// Classify by message: network hiccups, timeouts and 5xx/429 statuses
    /// are retryable, anything else is terminal.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if TRANSIENT.as_ref().is_some_and(|re| re.is_match(&message)) {
            FailureKind::Retryable
        } else {
            FailureKind::Terminal
        };
        Self { kind, message }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

impl From<anyhow::Error> for ToolFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::from_message(format!("{err:#}"))
    }
}

/// A tool the model can call. Implementations are supplied by the application.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool name as exposed to the model (e.g. "read_content").
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> Value;

    async fn call(&self, arguments: Value) -> Result<HandlerOutput, ToolFailure>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Registry of available tools, in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any earlier one with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Schemas for every registered tool, sent with each request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
