//! Byte-stream transport between the orchestrator and a provider.
//!
//! The transport only moves bytes: the adapter supplies URL and headers,
//! the [`crate::parser::StreamParser`] interprets what comes back.
//! Cancellation is dropping the returned stream.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::debug;

use parley_core::config::Config;
use parley_core::error::{ParleyError, Result};
use parley_core::types::ProviderId;

use crate::{ProtocolAdapter, ProviderPayload};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` and return the response body as it arrives.
    async fn open(
        &self,
        adapter: &dyn ProtocolAdapter,
        payload: &ProviderPayload,
    ) -> Result<ByteStream>;
}

/// Environment variable consulted when a provider entry names no key.
pub fn default_api_key_env(provider: ProviderId) -> &'static str {
    match provider {
        ProviderId::OpenAiChat | ProviderId::OpenAiResponses => "OPENAI_API_KEY",
        ProviderId::Anthropic => "ANTHROPIC_API_KEY",
        ProviderId::Gemini => "GEMINI_API_KEY",
        ProviderId::Mistral => "MISTRAL_API_KEY",
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: Option<String>,
    api_key: Option<String>,
}

/// Streams provider responses over HTTPS with `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: HashMap<ProviderId, Endpoint>,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn from_config(config: &Config) -> Self {
        let endpoints = ProviderId::ALL
            .into_iter()
            .map(|id| {
                let entry = config.provider(id);
                let api_key = entry
                    .and_then(|p| p.resolve_api_key())
                    .or_else(|| std::env::var(default_api_key_env(id)).ok())
                    .filter(|k| !k.is_empty());
                let endpoint = Endpoint {
                    base_url: entry.and_then(|p| p.base_url.clone()),
                    api_key,
                };
                (id, endpoint)
            })
            .collect();

        Self {
            client: reqwest::Client::new(),
            endpoints,
            connect_timeout: config.provider_timeout(),
        }
    }

    /// Whether an API key is available for `provider`.
    pub fn has_credentials(&self, provider: ProviderId) -> bool {
        self.endpoints
            .get(&provider)
            .is_some_and(|e| e.api_key.is_some())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        adapter: &dyn ProtocolAdapter,
        payload: &ProviderPayload,
    ) -> Result<ByteStream> {
        let provider = adapter.id();
        let endpoint = self.endpoints.get(&provider);
        let api_key = endpoint
            .and_then(|e| e.api_key.as_deref())
            .ok_or_else(|| {
                ParleyError::Config(format!(
                    "no API key for provider '{provider}' (set {} or providers[].api_key)",
                    default_api_key_env(provider)
                ))
            })?;
        let base_url = endpoint
            .and_then(|e| e.base_url.as_deref())
            .unwrap_or_else(|| adapter.default_base_url());
        let target = adapter.http_target(base_url, &payload.model, api_key);

        debug!(%provider, model = %payload.model, url = %target.url, "Opening provider stream");

        let mut request = self
            .client
            .post(&target.url)
            .header("content-type", "application/json")
            .json(&payload.body);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = tokio::time::timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| {
                ParleyError::Stream(format!(
                    "{provider} did not respond within {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| ParleyError::Stream(format!("{provider} request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ParleyError::Provider {
                provider: provider.to_string(),
                status: status.as_u16(),
                message: body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| ParleyError::Stream(format!("{provider}: {e}"))));
        Ok(Box::pin(stream))
    }
}

/// One canned response for [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum Script {
    /// Yield these chunks, then end.
    Chunks(Vec<Bytes>),
    /// Yield these chunks, then never produce another item.
    Stall(Vec<Bytes>),
    /// Yield these chunks, then fail with a transport error.
    Broken(Vec<Bytes>, String),
    /// Refuse the request with an HTTP status.
    Reject { status: u16, message: String },
}

impl Script {
    /// The whole body delivered as a single chunk.
    pub fn sse(body: impl Into<String>) -> Self {
        Script::Chunks(vec![Bytes::from(body.into())])
    }

    /// The body cut into `size`-byte chunks, splitting frames and
    /// multi-byte characters at arbitrary points.
    pub fn split(body: &str, size: usize) -> Self {
        let size = size.max(1);
        Script::Chunks(
            body.as_bytes()
                .chunks(size)
                .map(Bytes::copy_from_slice)
                .collect(),
        )
    }
}

/// Replays canned responses in order and records every payload sent.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    sent: Mutex<Vec<ProviderPayload>>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }

    /// Payloads sent so far, oldest first.
    pub fn sent(&self) -> Vec<ProviderPayload> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.scripts.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        adapter: &dyn ProtocolAdapter,
        payload: &ProviderPayload,
    ) -> Result<ByteStream> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(payload.clone());
        }
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .ok_or_else(|| {
                ParleyError::Stream(format!("no scripted response left for {}", adapter.id()))
            })?;

        let stream: ByteStream = match script {
            Script::Chunks(chunks) => Box::pin(chunk_stream(chunks)),
            Script::Stall(chunks) => {
                Box::pin(chunk_stream(chunks).chain(futures::stream::pending()))
            }
            Script::Broken(chunks, message) => Box::pin(
                chunk_stream(chunks)
                    .chain(futures::stream::iter([Err(ParleyError::Stream(message))])),
            ),
            Script::Reject { status, message } => {
                return Err(ParleyError::Provider {
                    provider: adapter.id().to_string(),
                    status,
                    message,
                });
            }
        };
        Ok(stream)
    }
}

fn chunk_stream(chunks: Vec<Bytes>) -> impl Stream<Item = Result<Bytes>> + Send {
    futures::stream::iter(chunks.into_iter().map(Ok::<Bytes, ParleyError>))
}
