//! JSONL-based transcript store, one JSONL file per session.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ParleyError, Result};
use crate::session::{SessionId, TranscriptStore};
use crate::types::CanonicalMessage;

/// File-based transcript store.
///
/// Layout:
/// - `<base>/sessions.json`: array of known session ids
/// - `<base>/transcripts/<hash>.jsonl`: one message per line
pub struct JsonlTranscriptStore {
    base: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionIndex {
    sessions: Vec<SessionId>,
}

impl JsonlTranscriptStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn index_path(&self) -> PathBuf {
        self.base.join("sessions.json")
    }

    fn transcript_dir(&self) -> PathBuf {
        self.base.join("transcripts")
    }

    fn transcript_path(&self, session: &SessionId) -> PathBuf {
        self.transcript_dir()
            .join(format!("{}.jsonl", session.hash_key()))
    }

    async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        tokio::fs::create_dir_all(self.transcript_dir()).await?;
        Ok(())
    }

    async fn load_index(&self) -> Result<SessionIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(SessionIndex::default());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn save_index(&self, index: &SessionIndex) -> Result<()> {
        self.ensure_dirs().await?;
        let data = serde_json::to_string_pretty(index)?;
        let path = self.index_path();
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for JsonlTranscriptStore {
    async fn load(&self, session: &SessionId) -> Result<Vec<CanonicalMessage>> {
        let path = self.transcript_path(session);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut messages = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let message: CanonicalMessage = serde_json::from_str(line)
                .map_err(|e| ParleyError::Session(format!("corrupt transcript line: {e}")))?;
            messages.push(message);
        }
        debug!(session = %session, messages = messages.len(), "Loaded transcript");
        Ok(messages)
    }

    async fn save(&self, session: &SessionId, messages: &[CanonicalMessage]) -> Result<()> {
        self.ensure_dirs().await?;

        let mut index = self.load_index().await?;
        if !index.sessions.contains(session) {
            index.sessions.push(session.clone());
            self.save_index(&index).await?;
        }

        let path = self.transcript_path(session);
        let mut data = String::new();
        for message in messages {
            data.push_str(&serde_json::to_string(message)?);
            data.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(session = %session, messages = messages.len(), "Saved transcript");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        Ok(self.load_index().await?.sessions)
    }

    async fn delete(&self, session: &SessionId) -> Result<()> {
        let mut index = self.load_index().await?;
        index.sessions.retain(|s| s != session);
        self.save_index(&index).await?;

        let path = self.transcript_path(session);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }

        debug!(session = %session, "Deleted transcript");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallRef, ToolResult};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        let id = SessionId::new("doc-42");

        let result = ToolResult {
            tool_call_id: "call_1".into(),
            name: "read_content".into(),
            success: true,
            payload: json!({"text": "abc"}),
            requires_confirmation: false,
            attempts: 1,
            elapsed_ms: 0,
        };
        let messages = vec![
            CanonicalMessage::user("Read the doc"),
            CanonicalMessage::assistant_tool_calls(
                None,
                vec![ToolCallRef {
                    id: "call_1".into(),
                    name: "read_content".into(),
                    arguments: json!({"document_id": "d1"}),
                }],
            ),
            CanonicalMessage::tool_result(&result),
            CanonicalMessage::assistant("It says abc."),
        ];

        store.save(&id, &messages).await.unwrap();
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded, messages);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        let id = SessionId::new("s");

        store.save(&id, &[CanonicalMessage::user("x")]).await.unwrap();
        store.save(&id, &[CanonicalMessage::user("y")]).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![id.clone()]);

        store.delete(&id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_line_is_session_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        let id = SessionId::new("bad");
        store.save(&id, &[]).await.unwrap();
        tokio::fs::write(store.transcript_path(&id), b"{not json}\n")
            .await
            .unwrap();

        let err = store.load(&id).await.unwrap_err();
        assert!(matches!(err, ParleyError::Session(_)));
    }
}
