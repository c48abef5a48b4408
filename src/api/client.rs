//! Client-facing request plane (§4.10, §6).
//!
//! Thin over [`crate::router`]: handlers translate HTTP concerns (status
//! codes, headers, JSON/SSE framing) into calls against [`AppState`] and
//! back. Every routed call is logged to `state.traffic`, `state.request_log`,
//! and `state.metrics` exactly once — on the synchronous success/failure
//! paths directly, and on the streaming path via [`StreamWithLogging`], whose
//! `Drop` impl fires the log write whether the stream finishes naturally or
//! is dropped by a client disconnect.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    body::Body,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    api::{auth::AuthenticatedClient, health::healthz, request_id::RequestId},
    backends::BackendClient,
    config::Capability,
    error::AppError,
    memory::{CompactRequest, ListRequest, SearchRequest, UpsertRequest},
    requestlog::RequestLogEntry,
    router::{self, AppState, RouteDecision},
    traffic::TrafficEntry,
};

/// Build the client-facing axum router. Auth/rate-limit/IP middleware is
/// layered on by the caller ([`crate::main`]) around this router — see the
/// module docs there for why `/health`/`/healthz` are mounted separately and
/// left unlayered.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/music/generations", post(music_generations))
        .route("/v1/tts", post(tts))
        .route("/v1/tools", get(list_tools).post(tools_dispatch))
        .route("/v1/tools/{name}", post(tools_invoke_named))
        .route("/v1/tools/replay/{replay_id}", get(tools_replay))
        .route("/v1/memory/upsert", post(memory_upsert))
        .route("/v1/memory/list", get(memory_list))
        .route("/v1/memory/search", post(memory_search))
        .route("/v1/memory/compact", post(memory_compact))
        .route("/v1/agent/run", post(agent_run))
        .route("/v1/agent/replay/{run_id}", get(agent_replay))
        .route("/ui/images/{name}", get(serve_image))
        .with_state(state)
}

/// `GET /healthz` — unauthenticated Docker/k8s liveness probe, never layered
/// with bearer auth. Kept separate from [`router`] so [`crate::main`] can
/// mount it before the auth middleware.
pub fn public_router(state: Arc<AppState>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}

// ---------------------------------------------------------------------
// logging helpers
// ---------------------------------------------------------------------

fn insert_route_headers(response: &mut Response, decision: &RouteDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.backend) {
        headers.insert("x-backend-used", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.upstream_model) {
        headers.insert("x-model-used", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reason) {
        headers.insert("x-router-reason", v);
    }
}

/// Record a completed request (any outcome) into the traffic log, the
/// process metrics, and — fire-and-forget, since `RequestLog::append` is
/// async and this is called from sync completion points too — the durable
/// JSONL request log.
#[allow(clippy::too_many_arguments)]
fn log_request(
    state: &AppState,
    request_id: &str,
    method: &str,
    path: &str,
    status: u16,
    latency_ms: u64,
    success: bool,
    stream: bool,
    requested_model: Option<&str>,
    decision: Option<&RouteDecision>,
    error: Option<&str>,
) {
    state.metrics.record_request(path, method, status, latency_ms);

    let mut traffic_entry = TrafficEntry::new(path.to_string(), latency_ms, success).with_stream(stream);
    if let Some(m) = requested_model {
        traffic_entry = traffic_entry.with_requested_model(m.to_string());
    }
    if let Some(d) = decision {
        traffic_entry = traffic_entry.with_route(d.backend.clone(), d.upstream_model.clone(), d.reason.clone());
    }
    if let Some(e) = error {
        traffic_entry = traffic_entry.with_error(e.to_string());
    }
    state.traffic.push(traffic_entry);

    let mut log_entry =
        RequestLogEntry::new(request_id.to_string(), method.to_string(), path.to_string(), status, latency_ms)
            .with_stream(stream);
    if let Some(d) = decision {
        log_entry = log_entry.with_route(d.backend.clone(), d.upstream_model.clone(), d.reason.clone());
    }
    let request_log = Arc::clone(&state.request_log);
    tokio::spawn(async move { request_log.append(&log_entry).await });
}

fn log_stream_request(
    state: &AppState,
    request_id: &str,
    path: &str,
    status: u16,
    latency_ms: u64,
    ttft_ms: u64,
    bytes_out: u64,
    chunks_out: u64,
    decision: &RouteDecision,
) {
    let success = status < 400;
    state.metrics.record_request(path, "POST", status, latency_ms);
    state.metrics.record_ttft(path, ttft_ms);

    let mut traffic_entry = TrafficEntry::new(path.to_string(), latency_ms, success)
        .with_stream(true)
        .with_route(decision.backend.clone(), decision.upstream_model.clone(), decision.reason.clone());
    if !success {
        traffic_entry = traffic_entry.with_error(format!("stream ended with status {status}"));
    }
    state.traffic.push(traffic_entry);

    let log_entry = RequestLogEntry::new(request_id.to_string(), "POST".to_string(), path.to_string(), status, latency_ms)
        .with_route(decision.backend.clone(), decision.upstream_model.clone(), decision.reason.clone())
        .with_stream(true)
        .with_stream_stats(ttft_ms, bytes_out, chunks_out);
    let request_log = Arc::clone(&state.request_log);
    tokio::spawn(async move { request_log.append(&log_entry).await });
}

// ---------------------------------------------------------------------
// chat / completions
// ---------------------------------------------------------------------

fn x_backend_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-backend").and_then(|v| v.to_str().ok())
}

fn requested_model(body: &Value) -> Option<String> {
    body.get("model").and_then(Value::as_str).map(str::to_string)
}

fn wants_stream(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

fn validate_chat_body(body: &Value) -> Result<(), AppError> {
    let messages_empty = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|m| m.is_empty())
        .unwrap_or(true);
    if messages_empty {
        return Err(AppError::BadRequest("`messages` must be a non-empty array".into()));
    }
    let has_tools = body.get("tools").and_then(Value::as_array).is_some_and(|t| !t.is_empty());
    if wants_stream(body) && has_tools {
        return Err(AppError::BadRequest("`stream:true` cannot be combined with `tools`".into()));
    }
    Ok(())
}

async fn dispatch_chat(state: Arc<AppState>, request_id: String, headers: HeaderMap, body: Value, path: &'static str) -> Response {
    let requested = requested_model(&body);
    let backend_header = x_backend_header(&headers).map(str::to_string);

    if let Err(e) = validate_chat_body(&body) {
        let status = e.status_code().as_u16();
        log_request(&state, &request_id, "POST", path, status, 0, false, false, requested.as_deref(), None, Some(&e.to_string()));
        return e.into_response();
    }

    if wants_stream(&body) {
        let t0 = Instant::now();
        match router::handle_chat_stream(&state, body, backend_header.as_deref()).await {
            Ok((stream, decision)) => {
                let mut response = build_sse_response(stream, Arc::clone(&state), request_id, path, decision.clone(), t0);
                insert_route_headers(&mut response, &decision);
                response
            }
            Err(e) => {
                let status = e.status_code().as_u16();
                let latency_ms = t0.elapsed().as_millis() as u64;
                log_request(&state, &request_id, "POST", path, status, latency_ms, false, true, requested.as_deref(), None, Some(&e.to_string()));
                e.into_response()
            }
        }
    } else {
        let t0 = Instant::now();
        match router::handle_chat(&state, body, backend_header.as_deref()).await {
            Ok(outcome) => {
                log_request(
                    &state,
                    &request_id,
                    "POST",
                    path,
                    200,
                    outcome.latency_ms,
                    true,
                    false,
                    requested.as_deref(),
                    Some(&outcome.decision),
                    None,
                );
                let mut response = Json(outcome.response).into_response();
                insert_route_headers(&mut response, &outcome.decision);
                response
            }
            Err(e) => {
                let status = e.status_code().as_u16();
                let latency_ms = t0.elapsed().as_millis() as u64;
                log_request(&state, &request_id, "POST", path, status, latency_ms, false, false, requested.as_deref(), None, Some(&e.to_string()));
                e.into_response()
            }
        }
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch_chat(state, request_id.0, headers, body, "/v1/chat/completions").await
}

#[derive(Deserialize)]
struct CompletionsRequest {
    model: Option<String>,
    prompt: Value,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    temperature: Option<f64>,
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(req): Json<CompletionsRequest>,
) -> Response {
    let prompt_text = match &req.prompt {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join("\n"),
        _ => return AppError::BadRequest("`prompt` must be a string or an array of strings".into()).into_response(),
    };

    let mut body = json!({
        "model": req.model.unwrap_or_default(),
        "messages": [{"role": "user", "content": prompt_text}],
        "stream": req.stream,
    });
    if let Some(v) = req.max_tokens {
        body["max_tokens"] = json!(v);
    }
    if let Some(v) = req.temperature {
        body["temperature"] = json!(v);
    }

    dispatch_chat(state, request_id.0, headers, body, "/v1/completions").await
}

// ---------------------------------------------------------------------
// streaming response + logging wrapper
// ---------------------------------------------------------------------

/// Wraps the translated [`crate::backends::SseStream`] to build the axum
/// streaming [`Response`], and logs the request exactly once via `Drop` —
/// covering both natural completion and an early client disconnect, since
/// axum drops the body stream in either case and `Drop::drop` cannot be
/// skipped the way a post-await log call could be on a cancelled future.
struct StreamWithLogging {
    inner: crate::backends::SseStream,
    state: Arc<AppState>,
    request_id: String,
    path: &'static str,
    decision: RouteDecision,
    start: Instant,
    ttft_ms: Option<u64>,
    bytes_out: u64,
    chunks_out: u64,
    status: u16,
    logged: bool,
}

impl Stream for StreamWithLogging {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if self.ttft_ms.is_none() && !chunk.is_empty() {
                    self.ttft_ms = Some(self.start.elapsed().as_millis() as u64);
                }
                self.bytes_out += chunk.len() as u64;
                self.chunks_out += 1;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.status = 502;
                let frame = AppError::UpstreamError(e.to_string()).to_sse_frame();
                self.bytes_out += frame.len() as u64;
                self.chunks_out += 1;
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamWithLogging {
    fn drop(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;
        let latency_ms = self.start.elapsed().as_millis() as u64;
        let ttft_ms = self.ttft_ms.unwrap_or(latency_ms);
        log_stream_request(
            &self.state,
            &self.request_id,
            self.path,
            self.status,
            latency_ms,
            ttft_ms,
            self.bytes_out,
            self.chunks_out,
            &self.decision,
        );
    }
}

fn build_sse_response(
    stream: crate::backends::SseStream,
    state: Arc<AppState>,
    request_id: String,
    path: &'static str,
    decision: RouteDecision,
    start: Instant,
) -> Response {
    let wrapped = StreamWithLogging {
        inner: stream,
        state,
        request_id,
        path,
        decision,
        start,
        ttft_ms: None,
        bytes_out: 0,
        chunks_out: 0,
        status: 200,
        logged: false,
    };
    let body = Body::from_stream(wrapped);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("static headers and streaming body always build a valid response")
}

// ---------------------------------------------------------------------
// models
// ---------------------------------------------------------------------

fn build_models_list(state: &AppState) -> Value {
    let config = state.config();
    let mut models = Vec::new();

    for (backend_id, backend) in &config.backends {
        models.push(json!({
            "id": format!("{backend_id}:{}", backend.default_model),
            "object": "model",
            "owned_by": backend_id,
        }));
        if let Some(fast) = &backend.fast_model {
            models.push(json!({
                "id": format!("{backend_id}:{fast}"),
                "object": "model",
                "owned_by": backend_id,
            }));
        }
        models.push(json!({ "id": backend_id, "object": "model", "owned_by": "gateway" }));
    }

    for name in state.aliases.names() {
        if let Some(alias) = state.aliases.get(name) {
            models.push(json!({
                "id": name,
                "object": "model",
                "owned_by": alias.backend,
                "upstream_model": alias.upstream_model,
                "context_window": alias.context_window,
            }));
        }
    }

    json!({ "object": "list", "data": models })
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(build_models_list(&state))
}

async fn get_model(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    let list = build_models_list(&state);
    list.get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.iter().find(|m| m.get("id").and_then(Value::as_str) == Some(id.as_str())))
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("unknown model: {id}")))
}

// ---------------------------------------------------------------------
// embeddings / rerank
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct EmbeddingsRequest {
    #[serde(default)]
    model: String,
    input: Value,
}

fn extract_texts(input: &Value) -> Result<Vec<String>, AppError> {
    match input {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(|| AppError::BadRequest("`input` array must contain only strings".into())))
            .collect(),
        _ => Err(AppError::BadRequest("`input` must be a string or an array of strings".into())),
    }
}

async fn route_capability(state: &AppState, model: &str, backend_header: Option<&str>, capability: Capability) -> Result<RouteDecision, AppError> {
    let config = state.config();
    let decision = router::decide_route(&json!({"model": model, "messages": []}), backend_header, &config, &state.aliases)?;

    if !state.health.is_ready(&decision.backend) {
        let health_error = state.health.status_for(&decision.backend).and_then(|s| s.error);
        return Err(AppError::Unavailable { backend: decision.backend.clone(), health_error });
    }
    let backend_cfg = config
        .backends
        .get(&decision.backend)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("route decided to unknown backend `{}`", decision.backend)))?;
    if !backend_cfg.supports(capability) {
        return Err(AppError::BadRequest(format!("capability_not_supported: backend `{}` does not support {capability}", decision.backend)));
    }
    Ok(decision)
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(req): Json<EmbeddingsRequest>,
) -> Response {
    let path = "/v1/embeddings";
    let texts = match extract_texts(&req.input) {
        Ok(t) => t,
        Err(e) => {
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&req.model), None, Some(&e.to_string()));
            return e.into_response();
        }
    };

    let decision = match route_capability(&state, &req.model, x_backend_header(&headers), Capability::Embeddings).await {
        Ok(d) => d,
        Err(e) => {
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&req.model), None, Some(&e.to_string()));
            return e.into_response();
        }
    };

    let config = state.config();
    let backend_cfg = &config.backends[&decision.backend];
    let permit = match state.admission.try_acquire(&decision.backend, Capability::Embeddings) {
        Ok(p) => p,
        Err(busy) => {
            let e: AppError = busy.into();
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&req.model), Some(&decision), Some(&e.to_string()));
            return e.into_response();
        }
    };
    let client = match BackendClient::new(backend_cfg) {
        Ok(c) => c,
        Err(err) => {
            let e = AppError::Internal(err);
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&req.model), Some(&decision), Some(&e.to_string()));
            return e.into_response();
        }
    };

    let t0 = Instant::now();
    let result = client.embeddings(&texts, &decision.upstream_model).await;
    drop(permit);
    let latency_ms = t0.elapsed().as_millis() as u64;

    match result {
        Ok(vectors) => {
            let data: Vec<Value> = vectors
                .into_iter()
                .enumerate()
                .map(|(i, v)| json!({"object": "embedding", "index": i, "embedding": v}))
                .collect();
            log_request(&state, &request_id.0, "POST", path, 200, latency_ms, true, false, Some(&req.model), Some(&decision), None);
            let mut response = Json(json!({"object": "list", "data": data, "model": decision.upstream_model})).into_response();
            insert_route_headers(&mut response, &decision);
            response
        }
        Err(err) => {
            let e = router::classify_upstream_error(err);
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), latency_ms, false, false, Some(&req.model), Some(&decision), Some(&e.to_string()));
            e.into_response()
        }
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Deserialize)]
struct RerankRequest {
    #[serde(default)]
    model: String,
    query: String,
    documents: Vec<String>,
}

async fn rerank(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(req): Json<RerankRequest>,
) -> Response {
    let path = "/v1/rerank";

    let decision = match route_capability(&state, &req.model, x_backend_header(&headers), Capability::Embeddings).await {
        Ok(d) => d,
        Err(e) => {
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&req.model), None, Some(&e.to_string()));
            return e.into_response();
        }
    };

    let config = state.config();
    let backend_cfg = &config.backends[&decision.backend];
    let permit = match state.admission.try_acquire(&decision.backend, Capability::Embeddings) {
        Ok(p) => p,
        Err(busy) => {
            let e: AppError = busy.into();
            return e.into_response();
        }
    };
    let client = match BackendClient::new(backend_cfg) {
        Ok(c) => c,
        Err(err) => return AppError::Internal(err).into_response(),
    };

    let mut all_texts = vec![req.query.clone()];
    all_texts.extend(req.documents.iter().cloned());

    let t0 = Instant::now();
    let result = client.embeddings(&all_texts, &decision.upstream_model).await;
    drop(permit);
    let latency_ms = t0.elapsed().as_millis() as u64;

    match result {
        Ok(vectors) => {
            let query_vec = &vectors[0];
            let mut scored: Vec<(usize, f64)> = vectors[1..]
                .iter()
                .enumerate()
                .map(|(i, v)| (i, cosine_similarity(query_vec, v)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            let results: Vec<Value> = scored
                .into_iter()
                .map(|(i, score)| json!({"index": i, "document": req.documents[i], "relevance_score": score}))
                .collect();

            log_request(&state, &request_id.0, "POST", path, 200, latency_ms, true, false, Some(&req.model), Some(&decision), None);
            let mut response = Json(json!({"object": "list", "model": decision.upstream_model, "results": results})).into_response();
            insert_route_headers(&mut response, &decision);
            response
        }
        Err(err) => {
            let e = router::classify_upstream_error(err);
            log_request(&state, &request_id.0, "POST", path, e.status_code().as_u16(), latency_ms, false, false, Some(&req.model), Some(&decision), Some(&e.to_string()));
            e.into_response()
        }
    }
}

// ---------------------------------------------------------------------
// images / music / tts
// ---------------------------------------------------------------------

async fn generate_via_capability(
    state: &Arc<AppState>,
    request_id: &str,
    headers: &HeaderMap,
    path: &'static str,
    upstream_path: &str,
    capability: Capability,
    mut body: Value,
) -> Response {
    let model = requested_model(&body).unwrap_or_default();
    let decision = match route_capability(state, &model, x_backend_header(headers), capability).await {
        Ok(d) => d,
        Err(e) => {
            log_request(state, request_id, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&model), None, Some(&e.to_string()));
            return e.into_response();
        }
    };

    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".into(), Value::String(decision.upstream_model.clone()));
    }

    let config = state.config();
    let backend_cfg = &config.backends[&decision.backend];
    let permit = match state.admission.try_acquire(&decision.backend, capability) {
        Ok(p) => p,
        Err(busy) => {
            let e: AppError = busy.into();
            log_request(state, request_id, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&model), Some(&decision), Some(&e.to_string()));
            return e.into_response();
        }
    };
    let client = match BackendClient::new(backend_cfg) {
        Ok(c) => c,
        Err(err) => {
            let e = AppError::Internal(err);
            log_request(state, request_id, "POST", path, e.status_code().as_u16(), 0, false, false, Some(&model), Some(&decision), Some(&e.to_string()));
            return e.into_response();
        }
    };

    let t0 = Instant::now();
    let result = client.generate(upstream_path, body).await;
    drop(permit);
    let latency_ms = t0.elapsed().as_millis() as u64;

    match result {
        Ok(response_body) => {
            log_request(state, request_id, "POST", path, 200, latency_ms, true, false, Some(&model), Some(&decision), None);
            let mut response = Json(response_body).into_response();
            insert_route_headers(&mut response, &decision);
            response
        }
        Err(err) => {
            let e = router::classify_upstream_error(err);
            log_request(state, request_id, "POST", path, e.status_code().as_u16(), latency_ms, false, false, Some(&model), Some(&decision), Some(&e.to_string()));
            e.into_response()
        }
    }
}

async fn images_generations(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let response_format = body.get("response_format").and_then(Value::as_str).unwrap_or("url").to_string();
    if response_format != "url" && response_format != "b64_json" {
        return AppError::BadRequest("`response_format` must be `url` or `b64_json`".into()).into_response();
    }
    // The upstream is always asked for b64 data so we can persist it to the
    // content-addressed image store when the client wants a URL back.
    if let Some(obj) = body.as_object_mut() {
        obj.insert("response_format".into(), Value::String("b64_json".into()));
    }

    let raw = generate_via_capability(&state, &request_id.0, &headers, "/v1/images/generations", "/v1/images/generations", Capability::Images, body).await;

    if response_format != "url" || raw.status() != StatusCode::OK {
        return raw;
    }
    rewrite_image_response_to_urls(&state, raw).await
}

async fn rewrite_image_response_to_urls(state: &Arc<AppState>, response: Response) -> Response {
    let (parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return Response::from_parts(parts, Body::empty());
    };
    let Ok(mut value) = serde_json::from_slice::<Value>(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };

    if let Some(items) = value.get_mut("data").and_then(Value::as_array_mut) {
        for item in items {
            let Some(b64) = item.get("b64_json").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let Ok(decoded) = base64_decode(&b64) else { continue };
            if let Ok(name) = state.images.put(&decoded, "png").await {
                if let Some(obj) = item.as_object_mut() {
                    obj.remove("b64_json");
                    obj.insert("url".into(), Value::String(format!("/ui/images/{name}")));
                }
            }
        }
    }

    let mut new_response = Json(value).into_response();
    *new_response.status_mut() = parts.status;
    *new_response.headers_mut() = parts.headers;
    new_response
}

fn base64_decode(s: &str) -> Result<Vec<u8>, anyhow::Error> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(s).map_err(anyhow::Error::from)
}

async fn music_generations(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let raw = generate_via_capability(&state, &request_id.0, &headers, "/v1/music/generations", "/v1/music/generations", Capability::Music, body).await;
    rewrite_audio_url(&state, raw).await
}

async fn tts(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let raw = generate_via_capability(&state, &request_id.0, &headers, "/v1/tts", "/v1/audio/speech", Capability::Tts, body).await;
    rewrite_audio_url(&state, raw).await
}

/// Rewrite an upstream `audio_url` (if present) to a gateway-served proxy
/// path under `/ui/images/{name}` — the same content-addressed store backs
/// images, music, and TTS output alike (§6: "a gateway-served proxy path").
async fn rewrite_audio_url(state: &Arc<AppState>, response: Response) -> Response {
    if response.status() != StatusCode::OK {
        return response;
    }
    let (parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return Response::from_parts(parts, Body::empty());
    };
    let Ok(mut value) = serde_json::from_slice::<Value>(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };

    if let Some(audio_url) = value.get("audio_url").and_then(Value::as_str) {
        if let Ok(resp) = reqwest::get(audio_url).await {
            if let Ok(audio_bytes) = resp.bytes().await {
                if let Ok(name) = state.images.put(&audio_bytes, "wav").await {
                    value["audio_url"] = Value::String(format!("/ui/images/{name}"));
                }
            }
        }
    }

    let mut new_response = Json(value).into_response();
    *new_response.status_mut() = parts.status;
    *new_response.headers_mut() = parts.headers;
    new_response
}

async fn serve_image(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.images.get(&name).await {
        Some(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type_for(&name))
            .body(Body::from(bytes))
            .expect("static headers and owned body always build a valid response"),
        None => AppError::NotFound(format!("unknown image: {name}")).into_response(),
    }
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".png") {
        "image/png"
    } else if name.ends_with(".jpg") || name.ends_with(".jpeg") {
        "image/jpeg"
    } else if name.ends_with(".webp") {
        "image/webp"
    } else if name.ends_with(".svg") {
        "image/svg+xml"
    } else if name.ends_with(".wav") {
        "audio/wav"
    } else {
        "application/octet-stream"
    }
}

// ---------------------------------------------------------------------
// tools
// ---------------------------------------------------------------------

async fn list_tools(State(state): State<Arc<AppState>>, client: Option<Extension<AuthenticatedClient>>) -> Json<Value> {
    let allowlist = client.map(|Extension(c)| c.policy.tools_allowlist.clone()).unwrap_or_default();
    let declarations = state.tools.list_declarations(&allowlist);
    Json(json!({ "object": "list", "data": declarations }))
}

/// A non-empty per-client `tools_allowlist` restricts which tools that
/// client may invoke, not just which ones it sees at `GET /v1/tools` — an
/// empty allowlist means unrestricted, matching [`crate::tools::ToolBus::list_declarations`].
fn check_client_tool_allowed(client: &Option<Extension<AuthenticatedClient>>, name: &str) -> Result<(), AppError> {
    if let Some(Extension(c)) = client {
        if !c.policy.tools_allowlist.is_empty() && !c.policy.tools_allowlist.iter().any(|t| t == name) {
            return Err(AppError::Forbidden(format!("tool not allowed for this client: {name}")));
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct ToolDispatchRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn tools_dispatch(
    State(state): State<Arc<AppState>>,
    client: Option<Extension<AuthenticatedClient>>,
    Json(req): Json<ToolDispatchRequest>,
) -> Response {
    if let Err(e) = check_client_tool_allowed(&client, &req.name) {
        return e.into_response();
    }
    let invocation = state.tools.invoke(&req.name, req.arguments).await;
    Json(serde_json::to_value(invocation).unwrap_or_else(|_| json!({"ok": false}))).into_response()
}

#[derive(Deserialize, Default)]
struct ToolArgs {
    #[serde(default)]
    arguments: Value,
}

async fn tools_invoke_named(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    client: Option<Extension<AuthenticatedClient>>,
    body: Option<Json<ToolArgs>>,
) -> Response {
    if let Err(e) = check_client_tool_allowed(&client, &name) {
        return e.into_response();
    }
    let args = body.map(|Json(b)| b.arguments).unwrap_or(Value::Null);
    let invocation = state.tools.invoke(&name, args).await;
    Json(serde_json::to_value(invocation).unwrap_or_else(|_| json!({"ok": false}))).into_response()
}

async fn tools_replay(State(state): State<Arc<AppState>>, Path(replay_id): Path<String>) -> Result<Json<Value>, AppError> {
    state
        .tools
        .replay(&replay_id)
        .map(|inv| Json(serde_json::to_value(inv).unwrap_or(Value::Null)))
        .ok_or_else(|| AppError::NotFound(format!("unknown replay_id: {replay_id}")))
}

// ---------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------

async fn memory_upsert(State(state): State<Arc<AppState>>, Json(req): Json<UpsertRequest>) -> Result<Json<Value>, AppError> {
    let record = state.memory.upsert(req).await.map_err(AppError::Internal)?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn memory_list(State(state): State<Arc<AppState>>, Query(req): Query<ListRequest>) -> Result<Json<Value>, AppError> {
    let records = state.memory.list(req).await.map_err(AppError::Internal)?;
    Ok(Json(json!({ "object": "list", "data": records })))
}

async fn memory_search(State(state): State<Arc<AppState>>, Json(req): Json<SearchRequest>) -> Result<Json<Value>, AppError> {
    let records = state.memory.search(req).await.map_err(AppError::Internal)?;
    Ok(Json(json!({ "object": "list", "data": records })))
}

async fn memory_compact(State(state): State<Arc<AppState>>, body: Option<Json<CompactRequest>>) -> Result<Json<Value>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let result = state.memory.compact(req).await.map_err(AppError::Internal)?;
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------
// agent
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct AgentRunRequest {
    #[serde(default = "default_agent_name")]
    agent: String,
    input: String,
}

fn default_agent_name() -> String {
    "default".to_string()
}

async fn agent_run(State(state): State<Arc<AppState>>, Json(req): Json<AgentRunRequest>) -> Result<Json<Value>, AppError> {
    let record = state.agent.run(&state, &req.agent, &req.input).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn agent_replay(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> Result<Json<Value>, AppError> {
    state
        .agent
        .replay(&run_id)
        .await
        .map(|record| Json(serde_json::to_value(record).unwrap_or(Value::Null)))
        .ok_or_else(|| AppError::NotFound(format!("unknown run_id: {run_id}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        config::{BackendConfig, Config, GatewayConfig, Provider, RouterConfig},
        traffic::TrafficLog,
    };

    fn config_with_backend(base_url: String) -> Config {
        let backend = BackendConfig {
            base_url,
            description: None,
            api_key_env: None,
            timeout_ms: 5_000,
            provider: Provider::OpenAI,
            capabilities: vec![Capability::Chat],
            concurrency_limits: HashMap::from([(Capability::Chat, 2)]),
            liveness_path: "/v1/models".into(),
            readiness_path: None,
            default_model: "gpt-4o".into(),
            fast_model: None,
            legacy_aliases: vec![],
            payload_policy: HashMap::new(),
        };
        let mut backends = HashMap::new();
        backends.insert("cloud".to_string(), backend);
        Config {
            gateway: GatewayConfig {
                client_port: 8080,
                admin_port: 8081,
                traffic_log_capacity: 10,
                log_level: None,
                bearer_tokens_env: "AI_GATEWAY_TEST_TOKENS_CLIENT".into(),
                token_policies_env: None,
                ip_allowlist: String::new(),
                max_request_bytes: 10_000_000,
                rate_limit_rpm: None,
                admin_token_env: None,
                request_log_path: None,
            },
            backends,
            router: RouterConfig { default_backend: "cloud".into(), ..Default::default() },
            aliases: HashMap::new(),
            tools: Default::default(),
            memory: Default::default(),
            agent: Default::default(),
            images: Default::default(),
            clients: vec![],
        }
    }

    async fn app_with_backend(server: &MockServer) -> Router {
        let config = Arc::new(config_with_backend(server.uri()));
        let state = Arc::new(
            AppState::new(config, std::path::PathBuf::from("test.toml"), Arc::new(TrafficLog::new(10))).unwrap(),
        );
        router(state)
    }

    fn post_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-request-id", "test-request-id")
            .extension(RequestId("test-request-id".into()))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn empty_messages_rejected_with_400() {
        let server = MockServer::start().await;
        let app = app_with_backend(&server).await;
        let req = post_request("/v1/chat/completions", json!({"model": "cloud", "messages": []}));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn streaming_with_tools_rejected_with_400() {
        let server = MockServer::start().await;
        let app = app_with_backend(&server).await;
        let body = json!({
            "model": "cloud",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "tools": [{"type": "function", "function": {"name": "noop"}}],
        });
        let req = post_request("/v1/chat/completions", body);
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_completions_routes_and_tags_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}]
            })))
            .mount(&server)
            .await;

        let app = app_with_backend(&server).await;
        let body = json!({"model": "cloud", "messages": [{"role": "user", "content": "hi"}]});
        let req = post_request("/v1/chat/completions", body);
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-backend-used").unwrap(), "cloud");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
    }

    #[tokio::test]
    async fn images_generations_rejects_unknown_response_format() {
        let server = MockServer::start().await;
        let app = app_with_backend(&server).await;
        let body = json!({"model": "cloud", "prompt": "a cat", "response_format": "bogus"});
        let req = post_request("/v1/images/generations", body);
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_model_id_returns_404() {
        let server = MockServer::start().await;
        let app = app_with_backend(&server).await;
        let req = Request::builder().method("GET").uri("/v1/models/does-not-exist").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn models_list_includes_backend_default_model() {
        let server = MockServer::start().await;
        let app = app_with_backend(&server).await;
        let req = Request::builder().method("GET").uri("/v1/models").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let ids: Vec<&str> = value["data"].as_array().unwrap().iter().filter_map(|m| m["id"].as_str()).collect();
        assert!(ids.contains(&"cloud:gpt-4o"));
    }

    #[tokio::test]
    async fn tool_dispatch_rejects_tool_outside_client_allowlist() {
        let server = MockServer::start().await;
        let config = Arc::new(config_with_backend(server.uri()));
        let state = Arc::new(
            AppState::new(config, std::path::PathBuf::from("test.toml"), Arc::new(TrafficLog::new(10))).unwrap(),
        );
        let app = router(Arc::clone(&state));

        let policy = crate::api::auth::TokenPolicy {
            ip_allowlist: None,
            tools_allowlist: vec!["allowed_tool".into()],
            rate_limit_rpm: None,
        };
        let client = AuthenticatedClient { token: "t".into(), policy: Arc::new(policy) };

        let req = Request::builder()
            .method("POST")
            .uri("/v1/tools")
            .header("content-type", "application/json")
            .extension(client)
            .body(Body::from(json!({"name": "shell", "arguments": {}}).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
