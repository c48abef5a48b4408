//! Ollama-native NDJSON adapter (`POST {base}/api/chat`, `POST {base}/api/embed`).
//!
//! Unlike [`super::OllamaAdapter`] (which speaks Ollama's OpenAI-compat
//! shim), this adapter speaks Ollama's native dialect directly: one JSON
//! object per line for streaming, `{"message": {...}, "done": bool}` for
//! single-shot responses, and a separate `/api/embed` endpoint (with a
//! per-text `/api/embeddings` fallback for older Ollama versions that don't
//! support batched embedding requests) — ported from
//! `call_ollama`/`embed_ollama`/`stream_ollama_chat_as_openai` in the
//! original gateway's `upstreams.py`.

use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Value};

use super::SseStream;
use crate::streaming;

pub struct NdjsonAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl NdjsonAdapter {
    pub fn new(base_url: String, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .build()
            .expect("failed to build streaming reqwest client");
        Self { client, stream_client, base_url }
    }

    /// Translate an OpenAI-shaped chat request to Ollama's native `/api/chat`
    /// body, call it non-streaming, and translate the response back.
    pub async fn chat_completions(&self, request: Value) -> anyhow::Result<Value> {
        let model = request["model"]
            .as_str()
            .context("`model` field is required")?
            .to_string();
        let mut payload = json!({
            "model": model,
            "messages": request["messages"],
            "stream": false,
        });
        if let Some(tools) = request.get("tools") {
            payload["tools"] = tools.clone();
        }
        if let Some(temp) = request["temperature"].as_f64() {
            payload["options"] = json!({ "temperature": temp });
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let text = response.text().await.context("reading Ollama response body")?;
        if !status.is_success() {
            anyhow::bail!("Ollama returned HTTP {status}: {text}");
        }

        let out: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing Ollama response as JSON: {text}"))?;

        let message = out.get("message").cloned().unwrap_or(json!({"role": "assistant", "content": ""}));
        let finish_reason = out
            .get("done_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop")
            .to_string();

        Ok(json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
        }))
    }

    /// Stream `/api/chat`, translating NDJSON lines to OpenAI SSE chunks.
    pub async fn chat_completions_stream(
        &self,
        request: Value,
        forward_thinking: bool,
    ) -> anyhow::Result<SseStream> {
        let model = request["model"]
            .as_str()
            .context("`model` field is required")?
            .to_string();
        let mut payload = json!({
            "model": model,
            "messages": request["messages"],
            "stream": true,
        });
        if let Some(tools) = request.get("tools") {
            payload["tools"] = tools.clone();
        }
        if let Some(temp) = request["temperature"].as_f64() {
            payload["options"] = json!({ "temperature": temp });
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned HTTP {status}: {body}");
        }

        let lines = ndjson_lines(response.bytes_stream().map(|r| r.map_err(anyhow::Error::from)));
        Ok(streaming::ndjson_to_sse(model, lines, forward_thinking))
    }

    /// Embed one or more texts via `POST /api/embed`, falling back to one
    /// `POST /api/embeddings` call per text on older Ollama servers that
    /// only support the singular endpoint.
    pub async fn embeddings(&self, texts: &[String], model: &str) -> anyhow::Result<Vec<Vec<f64>>> {
        let url = format!("{}/api/embed", self.base_url);
        let batch = self
            .client
            .post(&url)
            .json(&json!({"model": model, "input": texts}))
            .send()
            .await;

        if let Ok(resp) = batch {
            if resp.status().is_success() {
                if let Ok(body) = resp.json::<Value>().await {
                    if let Some(embeddings) = body.get("embeddings").and_then(Value::as_array) {
                        let parsed: Option<Vec<Vec<f64>>> = embeddings
                            .iter()
                            .map(|row| {
                                row.as_array().map(|r| {
                                    r.iter().filter_map(Value::as_f64).collect::<Vec<_>>()
                                })
                            })
                            .collect();
                        if let Some(parsed) = parsed {
                            if parsed.len() == texts.len() {
                                return Ok(parsed);
                            }
                        }
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(texts.len());
        let single_url = format!("{}/api/embeddings", self.base_url);
        for text in texts {
            let resp = self
                .client
                .post(&single_url)
                .json(&json!({"model": model, "prompt": text}))
                .send()
                .await
                .with_context(|| format!("POST {single_url}"))?;
            anyhow::ensure!(resp.status().is_success(), "Ollama embeddings returned HTTP {}", resp.status());
            let body: Value = resp.json().await.context("parsing Ollama embeddings response")?;
            let embedding = body
                .get("embedding")
                .and_then(Value::as_array)
                .context("no embedding in Ollama response")?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            out.push(embedding);
        }
        Ok(out)
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/", self.base_url);
        let response = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(response.status().is_success(), "Ollama health check returned HTTP {}", response.status());
        Ok(())
    }
}

/// Re-chunk a raw byte stream into complete NDJSON lines, buffering partial
/// lines across chunk boundaries. Lines are yielded as soon as a `\n` is
/// seen, so this never waits for the upstream body to finish — dropping the
/// returned stream (client disconnect) stops pulling from `bytes` immediately.
fn ndjson_lines(
    bytes: impl futures_util::Stream<Item = anyhow::Result<bytes::Bytes>> + Send + 'static,
) -> impl futures_util::Stream<Item = anyhow::Result<String>> + Send + 'static {
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    futures_util::stream::unfold(state, |(mut bytes, mut buf, finished)| async move {
        if finished {
            return None;
        }
        loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                return Some((Ok(line), (bytes, buf, false)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(e), (bytes, buf, true))),
                None => {
                    if buf.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    return Some((Ok(line), (bytes, buf, true)));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn chat_completions_translates_ollama_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "hi"},
                "done": true,
                "done_reason": "stop",
            })))
            .mount(&server)
            .await;

        let adapter = NdjsonAdapter::new(server.uri(), 5_000);
        let out = adapter
            .chat_completions(json!({"model": "qwen2.5", "messages": []}))
            .await
            .unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn embeddings_uses_batch_endpoint_when_available() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [[0.1, 0.2], [0.3, 0.4]],
            })))
            .mount(&server)
            .await;

        let adapter = NdjsonAdapter::new(server.uri(), 5_000);
        let out = adapter
            .embeddings(&["a".to_string(), "b".to_string()], "nomic-embed-text")
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn embeddings_falls_back_to_singular_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.5, 0.6]})))
            .mount(&server)
            .await;

        let adapter = NdjsonAdapter::new(server.uri(), 5_000);
        let out = adapter
            .embeddings(&["only".to_string()], "nomic-embed-text")
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.5, 0.6]]);
    }

    #[tokio::test]
    async fn ndjson_lines_reassembles_split_chunks() {
        let chunks: Vec<anyhow::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"a\":1}\n{\"b\":")),
            Ok(bytes::Bytes::from_static(b"2}\n")),
        ];
        let stream = futures_util::stream::iter(chunks);
        let lines: Vec<_> = ndjson_lines(stream).collect().await;
        let lines: Vec<String> = lines.into_iter().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }
}
