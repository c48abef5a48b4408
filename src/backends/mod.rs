//! Backend client factory and unified dispatch interface.
//!
//! [`BackendClient`] is an enum that wraps a concrete provider adapter chosen
//! at construction time from [`BackendConfig::provider`]. All routing code
//! interacts with the same API (`chat_completions`, `chat_completions_stream`,
//! `embeddings`, `health_check`); adapter-specific protocol differences —
//! schema translation, auth headers, endpoint paths, wire dialect — are fully
//! encapsulated in the adapter modules.

mod anthropic;
mod ndjson;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use ndjson::NdjsonAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::config::{BackendConfig, Provider};

/// A `Send`-able, heap-allocated SSE byte stream.
///
/// Each item is either a chunk of raw SSE data (already in OpenAI wire format)
/// or an error. The stream terminates when all data has been yielded.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Unified backend client — enum dispatch over concrete provider adapters.
///
/// Constructed via [`BackendClient::new`] from a [`BackendConfig`]. All callers
/// see a single API; the correct adapter is selected once at construction time.
pub enum BackendClient {
    /// OpenAI-compatible passthrough (also covers Ollama's OpenAI-compat shim
    /// and any other server that speaks the same wire schema).
    OpenAI(OpenAIAdapter),
    /// Anthropic Messages API with request/response translation.
    Anthropic(AnthropicAdapter),
    /// Ollama's native NDJSON dialect (`/api/chat`, `/api/embed`).
    Ndjson(NdjsonAdapter),
}

impl BackendClient {
    /// Build a backend client from config, resolving any API key from the environment.
    ///
    /// # Errors
    /// Returns an error if the configured `api_key_env` variable is required but
    /// unset in the environment (Anthropic always requires a key).
    pub fn new(cfg: &BackendConfig) -> anyhow::Result<Self> {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        let api_key = cfg.api_key();

        Ok(match cfg.provider {
            Provider::OpenAI => Self::OpenAI(OpenAIAdapter::new(base_url, cfg.timeout_ms, api_key)),
            Provider::Ndjson => Self::Ndjson(NdjsonAdapter::new(base_url, cfg.timeout_ms)),
            Provider::Anthropic => {
                let key = api_key.ok_or_else(|| {
                    let env_var = cfg.api_key_env.as_deref().unwrap_or("<unset>");
                    anyhow::anyhow!(
                        "Anthropic backend requires an API key; \
                         set the `{env_var}` environment variable"
                    )
                })?;
                Self::Anthropic(AnthropicAdapter::new(base_url, cfg.timeout_ms, key))
            }
        })
    }

    /// Forward a `/v1/chat/completions`-shaped request to the configured backend.
    ///
    /// The request body should have `model` and `stream` already rewritten by
    /// the router before this is called.
    pub async fn chat_completions(&self, request: Value) -> anyhow::Result<Value> {
        match self {
            Self::OpenAI(a) => a.chat_completions(request).await,
            Self::Anthropic(a) => a.chat_completions(request).await,
            Self::Ndjson(a) => a.chat_completions(request).await,
        }
    }

    /// Forward a streaming request and return an [`SseStream`].
    ///
    /// All backends produce OpenAI-compatible SSE output:
    /// - OpenAI-compatible backends proxy bytes verbatim.
    /// - Anthropic and NDJSON backends translate on-the-fly to OpenAI SSE.
    pub async fn chat_completions_stream(
        &self,
        request: Value,
        forward_thinking: bool,
    ) -> anyhow::Result<SseStream> {
        match self {
            Self::OpenAI(a) => a.chat_completions_stream(request).await,
            Self::Ndjson(a) => a.chat_completions_stream(request, forward_thinking).await,
            Self::Anthropic(a) => a.chat_completions_stream(request).await,
        }
    }

    /// Embed one or more texts. Returns an error for backends/providers with
    /// no embeddings support (e.g. Anthropic).
    pub async fn embeddings(&self, texts: &[String], model: &str) -> anyhow::Result<Vec<Vec<f64>>> {
        match self {
            Self::OpenAI(a) => {
                let resp = a
                    .embeddings(serde_json::json!({"model": model, "input": texts}))
                    .await?;
                parse_openai_embeddings(&resp)
            }
            Self::Ndjson(a) => a.embeddings(texts, model).await,
            Self::Anthropic(_) => anyhow::bail!("Anthropic backends do not support the embeddings capability"),
        }
    }

    /// Forward an arbitrary JSON request to `path` for capabilities only the
    /// OpenAI dialect defines (images, music, TTS). NDJSON and Anthropic
    /// backends don't speak these dialects, so this is an error for them —
    /// callers should only route `Capability::Images/Music/Tts` requests to
    /// backends whose provider supports it.
    pub async fn generate(&self, path: &str, request: Value) -> anyhow::Result<Value> {
        match self {
            Self::OpenAI(a) => a.post_json(path, request).await,
            Self::Ndjson(_) | Self::Anthropic(_) => {
                anyhow::bail!("this backend's provider does not support `{path}`")
            }
        }
    }

    /// Probe this backend for liveness. Implementation varies by provider.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        match self {
            Self::OpenAI(a) => a.health_check().await,
            Self::Anthropic(a) => a.health_check().await,
            Self::Ndjson(a) => a.health_check().await,
        }
    }
}

fn parse_openai_embeddings(resp: &Value) -> anyhow::Result<Vec<Vec<f64>>> {
    let data = resp
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("embeddings response missing `data` array"))?;
    data.iter()
        .map(|item| {
            item.get("embedding")
                .and_then(Value::as_array)
                .map(|v| v.iter().filter_map(Value::as_f64).collect())
                .ok_or_else(|| anyhow::anyhow!("embeddings item missing `embedding` array"))
        })
        .collect()
}
