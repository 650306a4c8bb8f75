//! In-memory documents and the tools that read and edit them.
//!
//! `read_content` answers directly. `insert_content` and `replace_content`
//! never modify a document themselves: they return a proposal with
//! `requires_confirmation` set, and the application commits it through
//! [`DocumentStore::commit`] once a human accepts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{HandlerOutput, ToolFailure, ToolHandler, ToolRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("unknown proposal: {0}")]
    UnknownProposal(String),

    #[error("document '{0}' changed since the proposal was made")]
    Stale(String),
}

/// A pending edit: the full text the document will have once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub document: String,
    pub operation: String,
    base: String,
    pub proposed: String,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<String, String>,
    proposals: HashMap<String, Proposal>,
}

/// Shared store of named text documents.
#[derive(Clone, Default)]
pub struct DocumentStore {
    inner: Arc<RwLock<Inner>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, name: impl Into<String>, content: impl Into<String>) {
        self.inner
            .write()
            .await
            .documents
            .insert(name.into(), content.into());
    }

    pub async fn get(&self, name: &str) -> Option<String> {
        self.inner.read().await.documents.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.documents.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn proposal(&self, id: &str) -> Option<Proposal> {
        self.inner.read().await.proposals.get(id).cloned()
    }

    async fn propose(
        &self,
        document: &str,
        operation: &str,
        edit: impl FnOnce(&str) -> Result<String, String>,
    ) -> Result<Proposal, String> {
        let mut inner = self.inner.write().await;
        let base = inner
            .documents
            .get(document)
            .cloned()
            .ok_or_else(|| DocumentError::NotFound(document.to_string()).to_string())?;
        let proposed = edit(&base)?;
        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            document: document.to_string(),
            operation: operation.to_string(),
            base,
            proposed,
        };
        inner.proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }

    /// Apply an accepted proposal. Fails if the document moved on since.
    pub async fn commit(&self, proposal_id: &str) -> Result<String, DocumentError> {
        let mut inner = self.inner.write().await;
        let proposal = inner
            .proposals
            .remove(proposal_id)
            .ok_or_else(|| DocumentError::UnknownProposal(proposal_id.to_string()))?;
        let current = inner
            .documents
            .get_mut(&proposal.document)
            .ok_or_else(|| DocumentError::NotFound(proposal.document.clone()))?;
        if *current != proposal.base {
            return Err(DocumentError::Stale(proposal.document));
        }
        *current = proposal.proposed.clone();
        debug!(document = %proposal.document, operation = %proposal.operation, "Committed proposal");
        Ok(proposal.proposed)
    }

    /// Drop a rejected proposal.
    pub async fn discard(&self, proposal_id: &str) -> Result<(), DocumentError> {
        self.inner
            .write()
            .await
            .proposals
            .remove(proposal_id)
            .map(|_| ())
            .ok_or_else(|| DocumentError::UnknownProposal(proposal_id.to_string()))
    }

    /// Register the three document tools against this store.
    pub fn register_tools(&self, registry: &mut ToolRegistry) {
        registry.register(Arc::new(ReadContentTool { store: self.clone() }));
        registry.register(Arc::new(InsertContentTool { store: self.clone() }));
        registry.register(Arc::new(ReplaceContentTool { store: self.clone() }));
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolFailure> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolFailure::terminal(format!("missing '{key}' parameter")))
}

fn proposal_output(proposal: &Proposal) -> HandlerOutput {
    HandlerOutput::proposal(json!({
        "proposal_id": proposal.id,
        "document": proposal.document,
        "operation": proposal.operation,
        "proposed": proposal.proposed,
    }))
}

pub struct ReadContentTool {
    store: DocumentStore,
}

#[async_trait]
impl ToolHandler for ReadContentTool {
    fn name(&self) -> &str {
        "read_content"
    }

    fn description(&self) -> &str {
        "Read a document, optionally with line offset and limit. Returns content with line numbers."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document": { "type": "string", "description": "Document name" },
                "offset": { "type": "integer", "description": "Line number to start from (0-indexed)" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return" }
            },
            "required": ["document"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<HandlerOutput, ToolFailure> {
        let name = str_arg(&arguments, "document")?;
        let offset = arguments.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = arguments.get("limit").and_then(Value::as_u64).map(|v| v as usize);

        let Some(content) = self.store.get(name).await else {
            return Ok(HandlerOutput::failed(json!({
                "error": DocumentError::NotFound(name.to_string()).to_string(),
                "available": self.store.names().await,
            })));
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let start = offset.min(total);
        let end = limit.map_or(total, |l| (offset + l).min(total));

        let mut text = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            text.push_str(&format!("{:>6}\t{line}\n", start + i + 1));
        }
        if text.is_empty() {
            text = "(empty document or offset beyond end)".into();
        }

        Ok(HandlerOutput::ok(json!({
            "document": name,
            "content": text,
            "total_lines": total,
        })))
    }
}

pub struct InsertContentTool {
    store: DocumentStore,
}

#[async_trait]
impl ToolHandler for InsertContentTool {
    fn name(&self) -> &str {
        "insert_content"
    }

    fn description(&self) -> &str {
        "Propose inserting text into a document, after an exact anchor text or at the end. The user must accept the change."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document": { "type": "string", "description": "Document name" },
                "text": { "type": "string", "description": "Text to insert" },
                "after": { "type": "string", "description": "Exact text to insert after (must match once); omit to append" }
            },
            "required": ["document", "text"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<HandlerOutput, ToolFailure> {
        let name = str_arg(&arguments, "document")?;
        let text = str_arg(&arguments, "text")?;
        let after = arguments.get("after").and_then(Value::as_str);

        let result = self
            .store
            .propose(name, "insert", |content| match after {
                None => Ok(format!("{content}{text}")),
                Some(anchor) => {
                    let at = unique_match(content, anchor)?;
                    let split = at + anchor.len();
                    Ok(format!("{}{text}{}", &content[..split], &content[split..]))
                }
            })
            .await;

        Ok(match result {
            Ok(proposal) => proposal_output(&proposal),
            Err(error) => HandlerOutput::failed(json!({ "error": error })),
        })
    }
}

pub struct ReplaceContentTool {
    store: DocumentStore,
}

#[async_trait]
impl ToolHandler for ReplaceContentTool {
    fn name(&self) -> &str {
        "replace_content"
    }

    fn description(&self) -> &str {
        "Propose replacing an exact text match in a document. The old_text must appear exactly once. The user must accept the change."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document": { "type": "string", "description": "Document name" },
                "old_text": { "type": "string", "description": "Exact text to replace (must match exactly once)" },
                "new_text": { "type": "string", "description": "Replacement text" }
            },
            "required": ["document", "old_text", "new_text"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<HandlerOutput, ToolFailure> {
        let name = str_arg(&arguments, "document")?;
        let old_text = str_arg(&arguments, "old_text")?;
        let new_text = str_arg(&arguments, "new_text")?;

        let result = self
            .store
            .propose(name, "replace", |content| {
                unique_match(content, old_text)?;
                Ok(content.replacen(old_text, new_text, 1))
            })
            .await;

        Ok(match result {
            Ok(proposal) => proposal_output(&proposal),
            Err(error) => HandlerOutput::failed(json!({ "error": error })),
        })
    }
}

/// Byte offset of the single occurrence of `needle`.
fn unique_match(content: &str, needle: &str) -> Result<usize, String> {
    if needle.is_empty() {
        return Err("match text must not be empty".into());
    }
    let mut matches = content.match_indices(needle);
    match (matches.next(), matches.next()) {
        (None, _) => Err("no match found in the document".into()),
        (Some((at, _)), None) => Ok(at),
        (Some(_), Some(_)) => Err(format!(
            "text matches {} times, it must match exactly once; include more surrounding context",
            content.matches(needle).count()
        )),
    }
}
