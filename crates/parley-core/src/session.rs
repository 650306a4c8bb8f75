//! Session identity and the transcript store contract.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::CanonicalMessage;

/// Identifies one conversation. Sessions never share turn or continuation state.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a stable hash string for use as a transcript filename.
    pub fn hash_key(&self) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Supplies prior transcripts and accepts finalized ones.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Load the transcript for a session (empty if unknown).
    async fn load(&self, session: &SessionId) -> Result<Vec<CanonicalMessage>>;

    /// Replace the transcript for a session.
    async fn save(&self, session: &SessionId, messages: &[CanonicalMessage]) -> Result<()>;

    /// List known sessions.
    async fn list(&self) -> Result<Vec<SessionId>>;

    /// Delete a session's transcript.
    async fn delete(&self, session: &SessionId) -> Result<()>;
}

/// Process-local transcript store.
#[derive(Default)]
pub struct InMemoryTranscriptStore {
    transcripts: RwLock<HashMap<SessionId, Vec<CanonicalMessage>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn load(&self, session: &SessionId) -> Result<Vec<CanonicalMessage>> {
        Ok(self
            .transcripts
            .read()
            .await
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, session: &SessionId, messages: &[CanonicalMessage]) -> Result<()> {
        self.transcripts
            .write()
            .await
            .insert(session.clone(), messages.to_vec());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.transcripts.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, session: &SessionId) -> Result<()> {
        self.transcripts.write().await.remove(session);
        Ok(())
    }
}
