//! Streaming event parser: provider SSE bytes in, canonical events out.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, trace};

use parley_core::types::CanonicalEvent;

use crate::extract::scope_call_id;
use crate::sse::{SseDecoder, SseFrame};
use crate::{EventMapper, FrameSignal, ProtocolAdapter};

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone)]
struct ToolCallAccumulator {
    key: String,
    id: String,
    name: String,
    arguments: String,
}

/// Turns a provider byte stream into canonical events, preserving arrival order.
///
/// After `StreamEnd` or `StreamError` the parser is finished and ignores
/// further input until [`StreamParser::reset`].
pub struct StreamParser {
    decoder: SseDecoder,
    mapper: Box<dyn EventMapper>,
    open_calls: Vec<ToolCallAccumulator>,
    completed: HashSet<String>,
    response_id: Option<String>,
    terminal: Option<Value>,
    saw_tool_events: bool,
    finished: bool,
    /// When set, synthetic call ids are scoped to this response round.
    round: Option<u32>,
}

impl StreamParser {
    pub fn new(mapper: Box<dyn EventMapper>) -> Self {
        Self {
            decoder: SseDecoder::new(),
            mapper,
            open_calls: Vec::new(),
            completed: HashSet::new(),
            response_id: None,
            terminal: None,
            saw_tool_events: false,
            finished: false,
            round: None,
        }
    }

    pub fn for_adapter(adapter: &dyn ProtocolAdapter) -> Self {
        Self::new(adapter.event_mapper())
    }

    /// Parser for the `round`-th response of a multi-response turn: synthetic
    /// ids become `<prefix>_call_r<round>_<n>`, matching
    /// [`extract_for_round`](crate::extract::extract_for_round).
    pub fn for_round(adapter: &dyn ProtocolAdapter, round: u32) -> Self {
        let mut parser = Self::for_adapter(adapter);
        parser.round = Some(round);
        parser
    }

    /// Feed raw transport bytes; returns the events completed by this chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        for frame in self.decoder.push(bytes) {
            self.dispatch(&frame, &mut events);
            if self.finished {
                break;
            }
        }
        events
    }

    /// The transport is exhausted: flush any trailing frame, close open calls,
    /// and emit `StreamEnd` if the provider never sent one.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if let Some(frame) = self.decoder.flush() {
            self.dispatch(&frame, &mut events);
        }
        if !self.finished {
            self.end(&mut events);
        }
        events
    }

    /// Clear all buffers for reuse on a new stream.
    pub fn reset(&mut self, mapper: Box<dyn EventMapper>) {
        let round = self.round;
        *self = Self::new(mapper);
        self.round = round;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether any incremental tool-call event was seen on this stream.
    pub fn saw_tool_events(&self) -> bool {
        self.saw_tool_events
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// The provider's terminal response body, when it sent one.
    pub fn terminal_payload(&self) -> Option<&Value> {
        self.terminal.as_ref()
    }

    fn dispatch(&mut self, frame: &SseFrame, events: &mut Vec<CanonicalEvent>) {
        trace!(event = ?frame.event, data = %frame.data, "SSE frame");
        for signal in self.mapper.map(frame) {
            if self.finished {
                return;
            }
            self.apply(signal, events);
        }
    }

    fn apply(&mut self, signal: FrameSignal, events: &mut Vec<CanonicalEvent>) {
        match signal {
            FrameSignal::ResponseId(id) => {
                if self.response_id.is_none() {
                    self.response_id = Some(id.clone());
                    events.push(CanonicalEvent::ResponseStarted { response_id: id });
                }
            }
            FrameSignal::Text(text) => {
                if !text.is_empty() {
                    events.push(CanonicalEvent::TextDelta { text });
                }
            }
            FrameSignal::CallStart { key, id, name } => {
                self.saw_tool_events = true;
                let id = self.scoped(id);
                if let Some(acc) = self.open_calls.iter_mut().find(|c| c.key == key) {
                    if acc.id.is_empty() {
                        acc.id = id;
                    }
                    if acc.name.is_empty() {
                        acc.name = name;
                    }
                    return;
                }
                if self.completed.contains(&id) {
                    return;
                }
                events.push(CanonicalEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                });
                self.open_calls.push(ToolCallAccumulator {
                    key,
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            FrameSignal::CallArgs { key, fragment } => {
                match self.open_calls.iter_mut().find(|c| c.key == key) {
                    Some(acc) => {
                        if fragment.is_empty() {
                            return;
                        }
                        acc.arguments.push_str(&fragment);
                        events.push(CanonicalEvent::ToolCallArgDelta {
                            id: acc.id.clone(),
                            fragment,
                        });
                    }
                    None => debug!(%key, "Argument delta for unknown tool call, ignoring"),
                }
            }
            FrameSignal::CallDone { key, arguments } => {
                if let Some(pos) = self.open_calls.iter().position(|c| c.key == key) {
                    let mut acc = self.open_calls.remove(pos);
                    if let Some(args) = arguments {
                        acc.arguments = args;
                    }
                    self.complete(acc.id, acc.name, acc.arguments, events);
                }
            }
            FrameSignal::CallWhole {
                id,
                name,
                arguments,
            } => {
                self.saw_tool_events = true;
                let id = self.scoped(id);
                if self.completed.contains(&id) {
                    return;
                }
                // Already streaming under another key: finish that accumulator instead.
                if let Some(pos) = self.open_calls.iter().position(|c| c.id == id) {
                    let acc = self.open_calls.remove(pos);
                    self.complete(acc.id, acc.name, arguments, events);
                    return;
                }
                events.push(CanonicalEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                });
                self.complete(id, name, arguments, events);
            }
            FrameSignal::CloseOpenCalls => self.close_open_calls(events),
            FrameSignal::Usage(usage) => events.push(CanonicalEvent::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }),
            FrameSignal::Terminal(payload) => self.terminal = Some(payload),
            FrameSignal::End => self.end(events),
            FrameSignal::Error(message) => {
                self.finished = true;
                events.push(CanonicalEvent::StreamError { message });
            }
        }
    }

    fn scoped(&self, id: String) -> String {
        match self.round {
            Some(round) => scope_call_id(&id, round),
            None => id,
        }
    }

    fn close_open_calls(&mut self, events: &mut Vec<CanonicalEvent>) {
        for acc in std::mem::take(&mut self.open_calls) {
            if self.finished {
                return;
            }
            self.complete(acc.id, acc.name, acc.arguments, events);
        }
    }

    fn end(&mut self, events: &mut Vec<CanonicalEvent>) {
        self.close_open_calls(events);
        if !self.finished {
            self.finished = true;
            events.push(CanonicalEvent::StreamEnd);
        }
    }

    fn complete(
        &mut self,
        id: String,
        name: String,
        arguments: String,
        events: &mut Vec<CanonicalEvent>,
    ) {
        if !self.completed.insert(id.clone()) {
            return;
        }
        let arguments = if arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            arguments
        };
        if let Err(e) = serde_json::from_str::<Value>(&arguments) {
            self.finished = true;
            events.push(CanonicalEvent::StreamError {
                message: format!("tool call '{name}' ({id}) has malformed arguments: {e}"),
            });
            return;
        }
        events.push(CanonicalEvent::ToolCallComplete {
            id,
            name,
            arguments,
        });
    }
}
