//! Tool executor: lookup, validation, deadline and bounded retries.

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, warn};

use parley_core::config::Config;
use parley_core::error::ParleyError;
use parley_core::types::{ToolCall, ToolCallStatus, ToolResult};

use crate::{HandlerOutput, ToolFailure, ToolRegistry};

/// Deadline and retry settings for tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorPolicy {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Retries after the first attempt, for retryable failures only.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_backoff: Duration,
}

/// Progress of [`ToolExecutor::execute_many`], reported in call order.
#[derive(Debug)]
pub enum BatchStep<'a> {
    Dispatching(&'a ToolCall),
    Finished(&'a ToolResult),
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl ExecutorPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.tool_timeout(),
            max_retries: config.max_retries(),
            base_backoff: config.base_backoff(),
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Runs tool calls against a registry. Every call yields a [`ToolResult`];
/// failures become results with `success: false` instead of errors.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutor {
    policy: ExecutorPolicy,
}

impl ToolExecutor {
    pub fn new(policy: ExecutorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ExecutorPolicy {
        self.policy
    }

    pub async fn execute(&self, call: &ToolCall, registry: &ToolRegistry) -> ToolResult {
        let started = Instant::now();
        let (outcome, attempts) = self.run(call, registry).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(output) => {
                debug!(tool = %call.name, id = %call.id, attempts, elapsed_ms, "Tool call finished");
                ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    success: output.success,
                    requires_confirmation: output.success && output.requires_confirmation,
                    payload: output.payload,
                    attempts,
                    elapsed_ms,
                }
            }
            Err(err) => {
                warn!(tool = %call.name, id = %call.id, attempts, error = %err, "Tool call failed");
                ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    success: false,
                    payload: json!({
                        "error": err.to_string(),
                        "kind": err.kind(),
                        "retryable": err.is_retryable(),
                    }),
                    requires_confirmation: false,
                    attempts,
                    elapsed_ms,
                }
            }
        }
    }

    /// Execute calls one after another, in order, updating each call's
    /// status. A failing call never stops the batch.
    ///
    /// `is_cancelled` is checked before every dispatch and once more at the
    /// end; when it fires the batch returns `None`. A call already running
    /// finishes first.
    pub async fn execute_many(
        &self,
        calls: &mut [ToolCall],
        registry: &ToolRegistry,
        is_cancelled: impl Fn() -> bool,
        mut observe: impl FnMut(BatchStep<'_>),
    ) -> Option<Vec<ToolResult>> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls.iter_mut() {
            if is_cancelled() {
                return None;
            }
            call.status = ToolCallStatus::Executing;
            observe(BatchStep::Dispatching(call));

            let result = self.execute(call, registry).await;
            call.status = if result.success {
                ToolCallStatus::Completed
            } else {
                ToolCallStatus::Failed
            };
            observe(BatchStep::Finished(&result));
            results.push(result);
        }
        if is_cancelled() {
            return None;
        }
        Some(results)
    }

    async fn run(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
    ) -> (Result<HandlerOutput, ParleyError>, u32) {
        let Some(handler) = registry.lookup(&call.name) else {
            return (Err(ParleyError::ToolNotFound(call.name.clone())), 0);
        };

        let missing = missing_required(&handler.schema().required_fields(), &call.arguments);
        if !missing.is_empty() {
            return (
                Err(ParleyError::ToolValidation {
                    tool: call.name.clone(),
                    missing,
                }),
                0,
            );
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let failure = match tokio::time::timeout(self.policy.timeout, handler.call(call.arguments.clone())).await {
                Ok(Ok(output)) => return (Ok(output), attempts),
                Ok(Err(failure)) => failure,
                Err(_) => ToolFailure::retryable(format!(
                    "timed out after {}ms",
                    self.policy.timeout.as_millis()
                )),
            };

            let retries_used = attempts - 1;
            if failure.is_retryable() && retries_used < self.policy.max_retries {
                let delay = self.policy.backoff(attempts);
                warn!(
                    tool = %call.name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Retryable tool failure, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let retryable = failure.is_retryable();
            return (
                Err(ParleyError::ToolExecution {
                    tool: call.name.clone(),
                    message: failure.message,
                    retryable,
                }),
                attempts,
            );
        }
    }
}

/// Required fields absent from (or null in) `arguments`.
fn missing_required(required: &[&str], arguments: &Value) -> Vec<String> {
    required
        .iter()
        .filter(|field| arguments.get(**field).is_none_or(Value::is_null))
        .map(|field| field.to_string())
        .collect()
}
