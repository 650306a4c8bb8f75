//! Continuation state: how a turn resumes after its tool calls ran.
//!
//! Handle-based providers keep the conversation server-side, so only the
//! response id is stored. History-based providers need the full outgoing
//! message list replayed, followed by the assistant's tool-call message and
//! one tool message per result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_core::error::{ParleyError, Result};
use parley_core::session::SessionId;
use parley_core::types::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, ContinuationContext, ProviderId,
    ToolResult, ToolSchema,
};
use parley_providers::{AdapterRegistry, ContinuationStyle};

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(later) = chrono::Duration::from_std(by)
            .ok()
            .and_then(|by| now.checked_add_signed(by))
        {
            *now = later;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The parts of a request that carry over to its continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTemplate {
    pub model: String,
    pub tools: Vec<ToolSchema>,
    pub system_instruction: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

impl RequestTemplate {
    fn of(request: &CanonicalRequest) -> Self {
        Self {
            model: request.model.clone(),
            tools: request.tools.clone(),
            system_instruction: request.system_instruction.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    fn request(&self, messages: Vec<CanonicalMessage>) -> CanonicalRequest {
        let mut request = CanonicalRequest::new(self.model.clone(), messages);
        request.tools = self.tools.clone();
        request.system_instruction = self.system_instruction.clone();
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;
        request
    }
}

#[derive(Debug, Clone)]
pub struct StoredContinuation {
    pub context: ContinuationContext,
    pub template: RequestTemplate,
    /// The assistant message that issued the tool calls.
    pub assistant: CanonicalMessage,
    pub stored_at: DateTime<Utc>,
}

type Key = (SessionId, ProviderId);

/// TTL-bounded continuation entries keyed by session and provider.
pub struct ContinuationStore {
    entries: Mutex<HashMap<Key, StoredContinuation>>,
    ttl: Duration,
    clock: Box<dyn Clock>,
}

impl ContinuationStore {
    pub fn new(ttl: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Box::new(SystemClock))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, StoredContinuation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &StoredContinuation, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.stored_at)
            .to_std()
            .is_ok_and(|age| age >= self.ttl)
    }

    pub fn put(
        &self,
        session: &SessionId,
        provider: ProviderId,
        context: ContinuationContext,
        template: RequestTemplate,
        assistant: CanonicalMessage,
    ) {
        let entry = StoredContinuation {
            context,
            template,
            assistant,
            stored_at: self.clock.now(),
        };
        self.entries().insert((session.clone(), provider), entry);
    }

    /// The live entry, if any. An expired entry is removed and reported missing.
    pub fn get(&self, session: &SessionId, provider: ProviderId) -> Option<StoredContinuation> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let key = (session.clone(), provider);
        let entry = entries.get(&key)?;
        if self.is_expired(entry, now) {
            debug!(session = %session, %provider, "Continuation expired");
            entries.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    pub fn remove(&self, session: &SessionId, provider: ProviderId) -> bool {
        self.entries().remove(&(session.clone(), provider)).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides, per provider, how tool results fold back into a request.
pub struct ContinuationManager {
    store: ContinuationStore,
    adapters: AdapterRegistry,
}

impl ContinuationManager {
    pub fn new(store: ContinuationStore, adapters: AdapterRegistry) -> Self {
        Self { store, adapters }
    }

    pub fn store(&self) -> &ContinuationStore {
        &self.store
    }

    /// Record how to resume after `response`, which answered `request`.
    ///
    /// `history` is the whole conversation the request stands for. A
    /// handle-resumed request only carries the newest tool messages, so a
    /// handle provider that returns no response id falls back to it.
    pub fn remember(
        &self,
        session: &SessionId,
        provider: ProviderId,
        request: &CanonicalRequest,
        response: &CanonicalResponse,
        history: &[CanonicalMessage],
    ) -> Result<()> {
        let style = self.adapters.get(provider)?.continuation_style();
        let context = match (style, response.response_id.as_deref()) {
            (ContinuationStyle::Handle, Some(id)) => ContinuationContext::Handle(id.to_string()),
            (ContinuationStyle::Handle, None) => {
                debug!(%provider, "No response id for handle-based provider, snapshotting history");
                ContinuationContext::History(history.to_vec())
            }
            (ContinuationStyle::History, _) => ContinuationContext::History(request.messages.clone()),
        };
        self.store.put(
            session,
            provider,
            context,
            RequestTemplate::of(request),
            response.assistant_message(),
        );
        Ok(())
    }

    /// Build the request that hands `results` back to the model.
    pub fn resume(
        &self,
        session: &SessionId,
        provider: ProviderId,
        results: &[ToolResult],
    ) -> Result<CanonicalRequest> {
        let stored = self
            .store
            .get(session, provider)
            .ok_or_else(|| ParleyError::ContinuationMissing {
                session_id: session.to_string(),
                provider: provider.to_string(),
            })?;
        let tool_messages: Vec<CanonicalMessage> = issue_order(&stored.assistant, results)
            .into_iter()
            .map(CanonicalMessage::tool_result)
            .collect();

        let request = match stored.context {
            ContinuationContext::Handle(handle) => {
                let mut request = stored.template.request(tool_messages);
                request.resume_handle = Some(handle);
                request
            }
            ContinuationContext::History(mut messages) => {
                messages.push(stored.assistant);
                messages.extend(tool_messages);
                stored.template.request(messages)
            }
        };
        Ok(request)
    }

    pub fn clear(&self, session: &SessionId, provider: ProviderId) {
        if self.store.remove(session, provider) {
            debug!(session = %session, %provider, "Continuation cleared");
        }
    }
}

/// Results ordered as the assistant issued the calls; unknown ids go last.
fn issue_order<'a>(assistant: &CanonicalMessage, results: &'a [ToolResult]) -> Vec<&'a ToolResult> {
    let position = |r: &ToolResult| {
        assistant
            .tool_calls
            .iter()
            .position(|c| c.id == r.tool_call_id)
            .unwrap_or(usize::MAX)
    };
    let mut ordered: Vec<&ToolResult> = results.iter().collect();
    ordered.sort_by_key(|r| position(r));
    ordered
}
