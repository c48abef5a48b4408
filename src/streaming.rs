//! Streaming Translator (§4.7).
//!
//! Two translation paths feed the same client-facing SSE contract
//! (`data: {...}\n\n`, terminated by `data: [DONE]\n\n`):
//!
//! - [`passthrough_openai_sse`] — upstream already speaks OpenAI-style SSE
//!   (MLX, vLLM, most OpenAI-compatible servers). Bytes pass through
//!   unmodified; we only watch for `[DONE]` to guarantee the client always
//!   sees a terminator even if the upstream connection drops first.
//! - [`ndjson_to_sse`] — upstream speaks Ollama's native NDJSON dialect
//!   (`{"message": {...}, "done": bool}` per line). Each line is translated
//!   into one or more OpenAI `chat.completion.chunk` SSE frames.
//!
//! Both are cancellation-safe: dropping the returned stream (client
//! disconnect, request timeout) simply stops polling the upstream body: no
//! upstream bytes are eagerly buffered past the last yielded chunk, and the
//! [`crate::admission::Permit`] held by the caller is released by its own
//! `Drop` impl when the handler future is dropped.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::backends::SseStream;

const SSE_DONE: &[u8] = b"data: [DONE]\n\n";
/// Sliding window large enough to hold `"data: [DONE]"` even if it straddles
/// two upstream chunks.
const DONE_SCAN_WINDOW: usize = 64;

pub(crate) fn sse_frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn new_chunk_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Pass upstream OpenAI-style SSE bytes straight through, synthesizing a
/// `[DONE]` terminator if the upstream stream ends without sending one.
pub fn passthrough_openai_sse(upstream: SseStream) -> SseStream {
    let state = (upstream, Vec::<u8>::with_capacity(DONE_SCAN_WINDOW), false, false);

    let stream = futures_util::stream::unfold(state, |(mut upstream, mut tail, mut done_seen, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match upstream.next().await {
                Some(Ok(chunk)) if !chunk.is_empty() => {
                    let mut hay = tail.clone();
                    hay.extend_from_slice(&chunk);
                    if contains(&hay, b"data: [DONE]") {
                        done_seen = true;
                    }
                    let keep_from = hay.len().saturating_sub(DONE_SCAN_WINDOW);
                    tail = hay[keep_from..].to_vec();
                    return Some((Ok(chunk), (upstream, tail, done_seen, false)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some((Err(e), (upstream, tail, done_seen, true))),
                None => {
                    if done_seen {
                        return None;
                    }
                    return Some((Ok(Bytes::from_static(SSE_DONE)), (upstream, tail, done_seen, true)));
                }
            }
        }
    });

    Box::pin(stream)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Translate an Ollama-native NDJSON chat stream into OpenAI SSE chunks.
///
/// `lines` yields one NDJSON line (without its trailing newline) per item,
/// already reassembled from the raw byte stream by the caller (see
/// [`crate::backends::ndjson`]).
pub fn ndjson_to_sse(
    model_name: String,
    lines: impl Stream<Item = Result<String, anyhow::Error>> + Send + 'static,
    forward_thinking: bool,
) -> SseStream {
    let chunk_id = new_chunk_id();
    let created = now_unix();

    let role_frame = sse_frame(&json!({
        "id": chunk_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model_name,
        "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": Value::Null}],
    }));

    let head = futures_util::stream::once(async move { Ok(role_frame) });

    let body = futures_util::stream::unfold(
        (Box::pin(lines), chunk_id.clone(), model_name.clone(), created, false, forward_thinking),
        |(mut lines, chunk_id, model_name, created, mut finished, forward_thinking)| async move {
            if finished {
                return None;
            }
            loop {
                let line = match lines.next().await {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Some((vec![Err(e)], (lines, chunk_id, model_name, created, true, forward_thinking))),
                    None => {
                        // Upstream ended without a `done` line; close cleanly anyway.
                        let closer = sse_frame(&json!({
                            "id": chunk_id, "object": "chat.completion.chunk", "created": created,
                            "model": model_name,
                            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                        }));
                        return Some((
                            vec![Ok(closer), Ok(Bytes::from_static(SSE_DONE))],
                            (lines, chunk_id, model_name, created, true, forward_thinking),
                        ));
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }
                let Ok(obj): Result<Value, _> = serde_json::from_str(&line) else {
                    continue;
                };

                let done = obj.get("done").and_then(Value::as_bool).unwrap_or(false);
                let content = obj
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                    .or_else(|| obj.get("response").and_then(Value::as_str));
                let thinking = obj
                    .get("message")
                    .and_then(|m| m.get("thinking"))
                    .and_then(Value::as_str);

                let mut frames = Vec::new();

                if forward_thinking {
                    if let Some(t) = thinking {
                        if !t.is_empty() {
                            frames.push(Ok(sse_frame(&json!({
                                "id": chunk_id, "object": "chat.completion.chunk", "created": created,
                                "model": model_name,
                                "choices": [{"index": 0, "delta": {"reasoning_content": t}, "finish_reason": Value::Null}],
                            }))));
                        }
                    }
                }

                if let Some(c) = content {
                    if !c.is_empty() {
                        frames.push(Ok(sse_frame(&json!({
                            "id": chunk_id, "object": "chat.completion.chunk", "created": created,
                            "model": model_name,
                            "choices": [{"index": 0, "delta": {"content": c}, "finish_reason": Value::Null}],
                        }))));
                    }
                }

                if done {
                    let finish_reason = obj.get("done_reason").and_then(Value::as_str).unwrap_or("stop");
                    frames.push(Ok(sse_frame(&json!({
                        "id": chunk_id, "object": "chat.completion.chunk", "created": created,
                        "model": model_name,
                        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}],
                    }))));
                    frames.push(Ok(Bytes::from_static(SSE_DONE)));
                    finished = true;
                }

                if frames.is_empty() && !done {
                    continue;
                }
                return Some((frames, (lines, chunk_id, model_name, created, finished, forward_thinking)));
            }
        },
    )
    .flat_map(futures_util::stream::iter);

    Box::pin(head.chain(body))
}
