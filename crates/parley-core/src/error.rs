use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    /// Malformed provider payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Provider rejected the request.
    #[error("Provider error ({provider}, status {status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    /// Transport or parse failure mid-stream.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for tool '{tool}': missing {missing:?}")]
    ToolValidation { tool: String, missing: Vec<String> },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("No continuation stored for session '{session_id}' on provider '{provider}'")]
    ContinuationMissing { session_id: String, provider: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Whether the failure is transient and may be retried by the tool executor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ParleyError::ToolExecution { retryable: true, .. })
    }

    /// Short machine-readable kind, used in event and result payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ParleyError::Protocol(_) => "protocol",
            ParleyError::Provider { .. } => "provider",
            ParleyError::Stream(_) => "stream",
            ParleyError::ToolNotFound(_) => "not_found",
            ParleyError::ToolValidation { .. } => "validation",
            ParleyError::ToolExecution { .. } => "execution",
            ParleyError::ContinuationMissing { .. } => "continuation_missing",
            ParleyError::UnknownProvider(_) => "unknown_provider",
            ParleyError::Session(_) => "session",
            ParleyError::Config(_) => "config",
            ParleyError::Io(_) => "io",
            ParleyError::Json(_) => "json",
            ParleyError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
