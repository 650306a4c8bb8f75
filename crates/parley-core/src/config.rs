//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};
use crate::types::ProviderId;

/// Top-level Parley configuration, read from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<u32>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Idle timeout for provider requests and streams (default: 60).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_secs: Option<u64>,

    /// Per-attempt deadline for tool handlers (default: 30).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt for retryable tool failures (default: 2).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// First backoff delay; doubles on each retry (default: 1000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuationConfig {
    /// How long stored resume context stays valid (default: 3600).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory for JSONL transcripts (default: `~/.parley/sessions`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    fn agent(&self) -> Option<&AgentConfig> {
        self.agent.as_ref()
    }

    /// Provider used when none is given on the command line.
    pub fn default_provider(&self) -> ProviderId {
        self.agent()
            .and_then(|a| a.provider)
            .or_else(|| self.providers.first().map(|p| p.id))
            .unwrap_or(ProviderId::OpenAiResponses)
    }

    /// Model for `provider`: the agent override, then the provider default.
    pub fn model_for(&self, provider: ProviderId) -> String {
        self.agent()
            .and_then(|a| a.model.clone())
            .or_else(|| self.provider(provider).and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| default_model(provider).to_string())
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.agent().and_then(|a| a.system_prompt.clone())
    }

    pub fn max_tokens(&self) -> u32 {
        self.agent().and_then(|a| a.max_tokens).unwrap_or(4096)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.agent().and_then(|a| a.temperature)
    }

    pub fn max_tool_iterations(&self) -> u32 {
        self.agent().and_then(|a| a.max_tool_iterations).unwrap_or(25)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeouts
                .as_ref()
                .and_then(|t| t.provider_secs)
                .unwrap_or(60),
        )
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.as_ref().and_then(|t| t.tool_secs).unwrap_or(30))
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.as_ref().and_then(|r| r.max_retries).unwrap_or(2)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(
            self.retry
                .as_ref()
                .and_then(|r| r.base_backoff_ms)
                .unwrap_or(1000),
        )
    }

    pub fn continuation_ttl(&self) -> Duration {
        Duration::from_secs(
            self.continuation
                .as_ref()
                .and_then(|c| c.ttl_secs)
                .unwrap_or(3600),
        )
    }

    /// Resolve the transcript directory.
    pub fn transcript_dir(&self) -> PathBuf {
        self.session
            .as_ref()
            .and_then(|s| s.transcript_dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("sessions"))
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for p in &self.providers {
            if p.resolve_api_key().is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
        }

        let active = self.default_provider();
        if self.provider(active).is_none() {
            warnings.push(format!("Active provider '{active}' has no providers[] entry"));
        }

        if self.timeouts.as_ref().and_then(|t| t.provider_secs) == Some(0) {
            errors.push("timeouts.provider_secs cannot be 0".to_string());
        }
        if self.timeouts.as_ref().and_then(|t| t.tool_secs) == Some(0) {
            errors.push("timeouts.tool_secs cannot be 0".to_string());
        }
        if self.continuation.as_ref().and_then(|c| c.ttl_secs) == Some(0) {
            errors.push("continuation.ttl_secs cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

/// Fallback model names per provider.
pub fn default_model(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::OpenAiChat | ProviderId::OpenAiResponses => "gpt-4o-mini",
        ProviderId::Anthropic => "claude-sonnet-4-20250514",
        ProviderId::Gemini => "gemini-2.0-flash",
        ProviderId::Mistral => "mistral-large-latest",
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
