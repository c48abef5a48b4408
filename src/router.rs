//! Router (§4.5) — pure routing decisions plus request-plane orchestration.
//!
//! [`decide_route`] is a pure function: given a chat request body, the
//! `x-backend` override header, the [`AliasRegistry`], and [`Config`], it
//! returns a [`RouteDecision`] naming the backend/model to use and a `reason`
//! tag describing which of the eight ordered rules fired. It performs no I/O
//! and never fails for a well-formed request — callers that get a `RouteDecision`
//! naming an unhealthy or over-capacity backend handle that separately (health
//! gating, admission control) rather than falling back to a different backend;
//! per §8, there is no automatic fallback once a route has been decided.
//!
//! [`AppState`] (generalizing the teacher's `RouterState`) is the shared
//! application state injected into every handler, and [`handle_chat`] /
//! [`handle_chat_stream`] are the orchestration entry points the request
//! plane (`api::client`) calls after auth and admission.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    admission::AdmissionController,
    agent::AgentRuntime,
    aliases::AliasRegistry,
    api::auth::AuthRegistry,
    api::rate_limit::RateLimiter,
    backends::{BackendClient, SseStream},
    config::{Capability, Config},
    error::AppError,
    health::HealthGate,
    images::ImageStore,
    memory::{MemoryStore, NullMemoryStore},
    metrics::Metrics,
    requestlog::RequestLog,
    tools::ToolBus,
    traffic::TrafficLog,
};

/// Coding-keyword classifier version tag, surfaced in routing reasons so the
/// heuristic can evolve without silently changing behavior under callers'
/// feet (DESIGN.md Open Question: classifier versioning).
const CODING_KEYWORDS_V1: &[&str] = &[
    "```", "def ", "class ", "function ", "fn ", "async fn", "import ", "package ",
    "#include", "public class", "SELECT ", "INSERT INTO", "stack trace", "traceback",
    "compile error", "segfault", "null pointer", "undefined is not a function",
    "npm install", "pip install", "cargo build", "git diff", "regex", "unit test",
];

/// A resolved routing outcome (§3 `RouteDecision`).
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub backend: String,
    pub upstream_model: String,
    pub reason: String,
    pub tools_allowed: bool,
    pub max_tokens_cap: Option<u64>,
    pub temperature_cap: Option<f64>,
}

/// Shared application state injected into every request handler via [`axum::extract::State`].
pub struct AppState {
    config_lock: Arc<RwLock<Arc<Config>>>,
    pub config_path: PathBuf,
    pub traffic: Arc<TrafficLog>,
    pub request_log: Arc<RequestLog>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
    pub admission: AdmissionController,
    pub health: Arc<HealthGate>,
    /// Built once at process start from the initial config — not hot-reloaded
    /// (§4.4: alias resolution is consulted on every route; see aliases.rs).
    pub aliases: AliasRegistry,
    pub tools: Arc<ToolBus>,
    pub agent: Arc<AgentRuntime>,
    pub auth: AuthRegistry,
    /// `None` when `gateway.rate_limit_rpm` is unset — the feature is off
    /// process-wide regardless of any per-token override (DESIGN.md).
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub images: Arc<ImageStore>,
    /// [`NullMemoryStore`] unless a real backend is wired in (DESIGN.md:
    /// §4.12 ships the contract only, not a concrete store).
    pub memory: Arc<dyn MemoryStore>,
}

impl AppState {
    pub fn new(config: Arc<Config>, config_path: PathBuf, traffic: Arc<TrafficLog>) -> anyhow::Result<Self> {
        let admission = AdmissionController::from_config(&config);
        let health = Arc::new(HealthGate::new(std::time::Duration::from_secs(5))?);
        let aliases = AliasRegistry::load(&config)?;
        let tools = Arc::new(ToolBus::new(config.tools.clone()));
        let request_log = Arc::new(RequestLog::new(config.gateway.request_log_path.clone()));
        let metrics = Arc::new(Metrics::new());
        let agent = Arc::new(AgentRuntime::new(config.agent.clone()));
        let auth = AuthRegistry::load(&config)?;
        let rate_limiter = config.gateway.rate_limit_rpm.map(|rpm| Arc::new(RateLimiter::new(rpm)));
        let images = Arc::new(ImageStore::new(&config.images));
        let memory: Arc<dyn MemoryStore> = Arc::new(NullMemoryStore);

        Ok(Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            traffic,
            request_log,
            metrics,
            started_at: Instant::now(),
            admission,
            health,
            aliases,
            tools,
            agent,
            auth,
            rate_limiter,
            images,
            memory,
        })
    }

    /// Returns a snapshot of the current live config. The lock is held only
    /// for the duration of `Arc::clone`, so it never blocks request handling.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Hand out the same shared lock backing [`Self::config`]/[`Self::replace_config`]
    /// so [`crate::health::run_forever`] reads the live config without a
    /// second source of truth.
    pub fn config_lock(&self) -> Arc<RwLock<Arc<Config>>> {
        Arc::clone(&self.config_lock)
    }

    /// Atomically replace the live config. Called only from the hot-reload
    /// task. Admission semaphores, aliases, and tools are NOT rebuilt — they
    /// are fixed at process start (DESIGN.md: reload only touches routing
    /// knobs and backend connection details, not capacity/identity).
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }
}

/// Pure routing decision over a `/v1/chat/completions`-shaped request body.
///
/// Evaluates the eight rules in order, stopping at the first that matches.
/// Returns `Err` only when the request is too malformed to route at all
/// (e.g. `model` is present but not a string).
pub fn decide_route(
    body: &Value,
    x_backend_header: Option<&str>,
    config: &Config,
    aliases: &AliasRegistry,
) -> Result<RouteDecision, AppError> {
    let model_field = body.get("model");
    if model_field.is_some() && model_field.and_then(Value::as_str).is_none() {
        return Err(AppError::BadRequest("`model` must be a string".into()));
    }
    let model = model_field.and_then(Value::as_str).unwrap_or("").trim();

    // Rule 1: explicit backend override via `x-backend` header.
    if let Some(backend_name) = x_backend_header {
        if let Some(backend_id) = config.resolve_backend_id(backend_name) {
            let backend = &config.backends[backend_id];
            let upstream_model = if model.is_empty() { backend.default_model.clone() } else { model.to_string() };
            return Ok(RouteDecision {
                backend: backend_id.to_string(),
                upstream_model,
                reason: "override:x-backend".to_string(),
                tools_allowed: true,
                max_tokens_cap: None,
                temperature_cap: None,
            });
        }
        return Err(AppError::BadRequest(format!("unknown x-backend: {backend_name}")));
    }

    // Rule 2: model names a declared alias (reserved or explicit).
    if let Some(alias) = aliases.get(model) {
        return Ok(RouteDecision {
            backend: alias.backend.clone(),
            upstream_model: alias.upstream_model.clone(),
            reason: "alias:model".to_string(),
            tools_allowed: alias.tools_allowed.unwrap_or(true),
            max_tokens_cap: alias.max_tokens_cap,
            temperature_cap: alias.temperature_cap,
        });
    }

    // Rule 3: pinned `<backend>:<model>` syntax.
    if let Some((backend_part, model_part)) = model.split_once(':') {
        if let Some(backend_id) = config.resolve_backend_id(backend_part) {
            if !model_part.is_empty() {
                return Ok(RouteDecision {
                    backend: backend_id.to_string(),
                    upstream_model: model_part.to_string(),
                    reason: "pinned:model".to_string(),
                    tools_allowed: true,
                    max_tokens_cap: None,
                    temperature_cap: None,
                });
            }
        }
    }

    // Rule 4: policy disabled — route the literal model straight to the
    // default backend with no heuristics applied.
    if !config.router.enable_policy {
        let upstream_model = if model.is_empty() { config.backends[&config.router.default_backend].default_model.clone() } else { model.to_string() };
        return Ok(RouteDecision {
            backend: config.router.default_backend.clone(),
            upstream_model,
            reason: "direct:model".to_string(),
            tools_allowed: true,
            max_tokens_cap: None,
            temperature_cap: None,
        });
    }

    // Rule 5: coding heuristic.
    if config.router.enable_request_type && looks_like_coding(body) {
        if let Some(alias) = aliases.get("coder") {
            return Ok(RouteDecision {
                backend: alias.backend.clone(),
                upstream_model: alias.upstream_model.clone(),
                reason: "policy:coding->alias:coder".to_string(),
                tools_allowed: alias.tools_allowed.unwrap_or(true),
                max_tokens_cap: alias.max_tokens_cap,
                temperature_cap: alias.temperature_cap,
            });
        }
    }

    // Rule 6: request declares tools — route to a tools-capable alias.
    if body.get("tools").and_then(Value::as_array).is_some_and(|t| !t.is_empty()) {
        if let Some(alias) = aliases.get("default") {
            return Ok(RouteDecision {
                backend: alias.backend.clone(),
                upstream_model: alias.upstream_model.clone(),
                reason: "policy:tools->alias:default".to_string(),
                tools_allowed: true,
                max_tokens_cap: alias.max_tokens_cap,
                temperature_cap: alias.temperature_cap,
            });
        }
    }

    // Rule 7: long-context heuristic.
    if approx_char_len(body) as u64 > config.router.long_context_chars_threshold {
        if let Some(alias) = aliases.get("long") {
            return Ok(RouteDecision {
                backend: alias.backend.clone(),
                upstream_model: alias.upstream_model.clone(),
                reason: "policy:long_context->alias:long".to_string(),
                tools_allowed: alias.tools_allowed.unwrap_or(false),
                max_tokens_cap: alias.max_tokens_cap,
                temperature_cap: alias.temperature_cap,
            });
        }
    }

    // Rule 8: default policy — fast tier.
    let alias = aliases.get("fast").expect("`fast` is a reserved alias, always present");
    Ok(RouteDecision {
        backend: alias.backend.clone(),
        upstream_model: alias.upstream_model.clone(),
        reason: "policy:fast->alias:fast".to_string(),
        tools_allowed: alias.tools_allowed.unwrap_or(false),
        max_tokens_cap: alias.max_tokens_cap,
        temperature_cap: alias.temperature_cap,
    })
}

fn looks_like_coding(body: &Value) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else { return false };
    let Some(last_user) = messages.iter().rev().find(|m| m.get("role").and_then(Value::as_str) == Some("user")) else {
        return false;
    };
    let Some(content) = last_user.get("content").and_then(Value::as_str) else { return false };
    let lower = content.to_lowercase();
    CODING_KEYWORDS_V1.iter().any(|kw| lower.contains(&kw.to_lowercase()))
}

fn approx_char_len(body: &Value) -> usize {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|msgs| {
            msgs.iter()
                .filter_map(|m| m.get("content").and_then(Value::as_str))
                .map(str::len)
                .sum()
        })
        .unwrap_or(0)
}

/// Rewrite `model`/`stream` in place and apply alias constraints (token/temp caps).
fn apply_decision(body: &mut Value, decision: &RouteDecision, stream: bool) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".into(), Value::String(decision.upstream_model.clone()));
        obj.insert("stream".into(), Value::Bool(stream));
        if let Some(cap) = decision.max_tokens_cap {
            let current = obj.get("max_tokens").and_then(Value::as_u64).unwrap_or(u64::MAX);
            obj.insert("max_tokens".into(), Value::from(current.min(cap)));
        }
        if let Some(cap) = decision.temperature_cap {
            let current = obj.get("temperature").and_then(Value::as_f64).unwrap_or(0.0);
            if current > cap {
                obj.insert("temperature".into(), serde_json::json!(cap));
            }
        }
    }
}

/// Outcome of a completed (non-streaming) chat route, carrying the headers
/// the request plane must echo back (§4.10: `X-Backend-Used`, `X-Model-Used`,
/// `X-Router-Reason`).
pub struct ChatOutcome {
    pub response: Value,
    pub decision: RouteDecision,
    pub latency_ms: u64,
}

/// Orchestrate one non-streaming `/v1/chat/completions` call: decide route,
/// check health, acquire admission, dispatch, release.
pub async fn handle_chat(
    state: &AppState,
    mut body: Value,
    x_backend_header: Option<&str>,
) -> Result<ChatOutcome, AppError> {
    let config = state.config();
    let decision = decide_route(&body, x_backend_header, &config, &state.aliases)?;

    if body.get("tools").and_then(Value::as_array).is_some_and(|t| !t.is_empty()) && !decision.tools_allowed {
        return Err(AppError::BadRequest(format!(
            "model `{}` does not support tool calls",
            decision.upstream_model
        )));
    }

    if !state.health.is_ready(&decision.backend) {
        warn!(backend = %decision.backend, "backend not ready — refusing with 503, no fallback");
        let health_error = state.health.status_for(&decision.backend).and_then(|s| s.error);
        return Err(AppError::Unavailable { backend: decision.backend.clone(), health_error });
    }

    let backend_cfg = config
        .backends
        .get(&decision.backend)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("route decided to unknown backend `{}`", decision.backend)))?;

    let permit = state.admission.try_acquire(&decision.backend, Capability::Chat)?;

    apply_decision(&mut body, &decision, false);
    debug!(backend = %decision.backend, model = %decision.upstream_model, reason = %decision.reason, "dispatching chat completion");

    let client = BackendClient::new(backend_cfg).map_err(|e| AppError::Internal(e))?;
    let t0 = Instant::now();
    let result = client.chat_completions(body).await;
    drop(permit);
    let latency_ms = t0.elapsed().as_millis() as u64;

    match result {
        Ok(response) => Ok(ChatOutcome { response, decision, latency_ms }),
        Err(e) => Err(classify_upstream_error(e)),
    }
}

/// Orchestrate one streaming `/v1/chat/completions` call, returning the
/// translated [`SseStream`] plus the [`RouteDecision`] for response headers.
pub async fn handle_chat_stream(
    state: &AppState,
    mut body: Value,
    x_backend_header: Option<&str>,
) -> Result<(SseStream, RouteDecision), AppError> {
    let config = state.config();
    let decision = decide_route(&body, x_backend_header, &config, &state.aliases)?;

    if !state.health.is_ready(&decision.backend) {
        let health_error = state.health.status_for(&decision.backend).and_then(|s| s.error);
        return Err(AppError::Unavailable { backend: decision.backend.clone(), health_error });
    }

    let backend_cfg = config
        .backends
        .get(&decision.backend)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("route decided to unknown backend `{}`", decision.backend)))?;

    let permit = state.admission.try_acquire(&decision.backend, Capability::Chat)?;
    apply_decision(&mut body, &decision, true);

    let client = BackendClient::new(backend_cfg).map_err(|e| AppError::Internal(e))?;
    let forward_thinking = config.router.stream_forward_thinking;
    let stream = client
        .chat_completions_stream(body, forward_thinking)
        .await
        .map_err(classify_upstream_error)?;

    // The permit is moved into a small wrapper stream so it is released only
    // once the stream finishes or is dropped (client disconnect/timeout) —
    // never held past the point this function returns.
    let guarded = crate::admission::guard_stream(stream, permit);
    Ok((guarded, decision))
}

pub(crate) fn classify_upstream_error(e: anyhow::Error) -> AppError {
    let text = e.to_string();
    if text.contains("timeout") || text.contains("timed out") {
        AppError::UpstreamTimeout(text)
    } else {
        AppError::UpstreamError(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Provider, RouterConfig};
    use serde_json::json;
    use std::collections::HashMap;

    fn config_with_two_backends() -> Config {
        let mut concurrency = HashMap::new();
        concurrency.insert(Capability::Chat, 2);
        let gpu = BackendConfig {
            base_url: "http://127.0.0.1:11434".into(),
            description: None,
            api_key_env: None,
            timeout_ms: 1000,
            provider: Provider::Ndjson,
            capabilities: vec![Capability::Chat],
            concurrency_limits: concurrency.clone(),
            liveness_path: "/".into(),
            readiness_path: None,
            default_model: "qwen2.5:32b".into(),
            fast_model: Some("qwen2.5:7b".into()),
            legacy_aliases: vec!["ollama".into()],
            payload_policy: HashMap::new(),
        };
        let cloud = BackendConfig {
            base_url: "https://api.example.com".into(),
            description: None,
            api_key_env: None,
            timeout_ms: 1000,
            provider: Provider::OpenAI,
            capabilities: vec![Capability::Chat],
            concurrency_limits: concurrency,
            liveness_path: "/".into(),
            readiness_path: None,
            default_model: "gpt-4o".into(),
            fast_model: None,
            legacy_aliases: vec![],
            payload_policy: HashMap::new(),
        };
        let mut backends = HashMap::new();
        backends.insert("gpu_heavy".to_string(), gpu);
        backends.insert("cloud".to_string(), cloud);
        Config {
            gateway: crate::config::GatewayConfig {
                client_port: 8080,
                admin_port: 8081,
                traffic_log_capacity: 10,
                log_level: None,
                bearer_tokens_env: "T".into(),
                token_policies_env: None,
                ip_allowlist: String::new(),
                max_request_bytes: 1000,
                rate_limit_rpm: None,
                admin_token_env: None,
                request_log_path: None,
            },
            backends,
            router: RouterConfig { default_backend: "gpu_heavy".into(), ..Default::default() },
            aliases: HashMap::new(),
            tools: Default::default(),
            memory: Default::default(),
            agent: Default::default(),
            images: Default::default(),
            clients: vec![],
        }
    }

    #[test]
    fn header_override_wins_over_everything_else() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"model": "coder", "messages": []});
        let decision = decide_route(&body, Some("cloud"), &config, &aliases).unwrap();
        assert_eq!(decision.backend, "cloud");
        assert_eq!(decision.reason, "override:x-backend");
    }

    #[test]
    fn alias_rule_resolves_before_pinned_or_policy() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"model": "fast", "messages": []});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.reason, "alias:model");
        assert_eq!(decision.upstream_model, "qwen2.5:7b");
    }

    #[test]
    fn pinned_backend_colon_model_syntax_resolves() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"model": "cloud:gpt-4o-mini", "messages": []});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.backend, "cloud");
        assert_eq!(decision.upstream_model, "gpt-4o-mini");
        assert_eq!(decision.reason, "pinned:model");
    }

    #[test]
    fn coding_heuristic_routes_to_coder_alias() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"messages": [{"role": "user", "content": "```rust\nfn main() {}\n```"}]});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.reason, "policy:coding->alias:coder");
    }

    #[test]
    fn tools_present_routes_to_tools_capable_default_alias() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"messages": [{"role": "user", "content": "hello there"}], "tools": [{"type": "function"}]});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.reason, "policy:tools->alias:default");
    }

    #[test]
    fn long_context_heuristic_fires_above_threshold() {
        let mut config = config_with_two_backends();
        config.router.long_context_chars_threshold = 10;
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"messages": [{"role": "user", "content": "this message is definitely longer than ten characters"}]});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.reason, "policy:long_context->alias:long");
    }

    #[test]
    fn default_falls_through_to_fast_policy() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.reason, "policy:fast->alias:fast");
    }

    #[test]
    fn policy_disabled_routes_direct_to_default_backend() {
        let mut config = config_with_two_backends();
        config.router.enable_policy = false;
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"model": "some-literal-model", "messages": []});
        let decision = decide_route(&body, None, &config, &aliases).unwrap();
        assert_eq!(decision.backend, "gpu_heavy");
        assert_eq!(decision.reason, "direct:model");
        assert_eq!(decision.upstream_model, "some-literal-model");
    }

    #[test]
    fn unknown_header_override_backend_is_rejected() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"messages": []});
        let result = decide_route(&body, Some("nonexistent"), &config, &aliases);
        assert!(result.is_err());
    }

    #[test]
    fn non_string_model_field_is_rejected() {
        let config = config_with_two_backends();
        let aliases = AliasRegistry::load(&config).unwrap();
        let body = json!({"model": 5, "messages": []});
        let result = decide_route(&body, None, &config, &aliases);
        assert!(result.is_err());
    }
}
