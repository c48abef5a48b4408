//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from the internal Docker network, never exposed to the internet), and
//! gated by [`crate::api::admin_auth::admin_auth_middleware`] when
//! `gateway.admin_token_env` is configured.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{backends::BackendClient, router::AppState};

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/backends/health", get(backends_health))
        .with_state(state)
}

/// GET /admin/health — process liveness plus registry sizes.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "backends": config.backends.len(),
        "aliases": state.aliases.names().count(),
        "tools": state.tools.allowed_tool_names().len(),
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N — recent N traffic entries (default 100) plus
/// aggregate stats over the full in-memory ring buffer.
pub async fn traffic(State(state): State<Arc<AppState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({
        "stats": stats,
        "entries": entries,
    }))
}

/// GET /admin/config — current config with secrets redacted (env var names
/// shown, resolved values never are).
pub async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.config();

    let backends: Vec<Value> = cfg
        .backends
        .iter()
        .map(|(name, b)| {
            json!({
                "name": name,
                "base_url": b.base_url,
                "provider": b.provider.to_string(),
                "api_key_env": b.api_key_env,
                "capabilities": b.capabilities,
                "default_model": b.default_model,
                "fast_model": b.fast_model,
            })
        })
        .collect();

    let aliases: Vec<Value> = state
        .aliases
        .names()
        .filter_map(|name| state.aliases.get(name).map(|a| (name, a)))
        .map(|(name, a)| {
            json!({
                "name": name,
                "backend": a.backend,
                "upstream_model": a.upstream_model,
                "context_window": a.context_window,
                "tools_allowed": a.tools_allowed,
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
            "max_request_bytes": cfg.gateway.max_request_bytes,
            "rate_limit_rpm": cfg.gateway.rate_limit_rpm,
        },
        "backends": backends,
        "router": {
            "default_backend": cfg.router.default_backend,
            "long_context_chars_threshold": cfg.router.long_context_chars_threshold,
            "enable_policy": cfg.router.enable_policy,
            "enable_request_type": cfg.router.enable_request_type,
            "stream_forward_thinking": cfg.router.stream_forward_thinking,
        },
        "aliases": aliases,
        "tools": {
            "allowlist": state.tools.allowed_tool_names(),
        },
        "memory": {
            "enabled": cfg.memory.enabled,
        },
        "agent": {
            "shed_heavy": cfg.agent.shed_heavy,
        },
    }))
}

/// GET /admin/backends/health — live-probe every configured backend's
/// liveness endpoint (distinct from [`crate::health::HealthGate`]'s cached
/// table — this hits the network on every call, for operator debugging).
pub async fn backends_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config();
    let mut results = Vec::new();

    for (name, backend_cfg) in &config.backends {
        let client = match BackendClient::new(backend_cfg) {
            Ok(c) => c,
            Err(e) => {
                results.push(json!({
                    "backend": name,
                    "status": "error",
                    "error": e.to_string(),
                }));
                continue;
            }
        };

        match client.health_check().await {
            Ok(_) => results.push(json!({ "backend": name, "status": "ok" })),
            Err(e) => results.push(json!({
                "backend": name,
                "status": "unreachable",
                "error": e.to_string(),
            })),
        }
    }

    let all_ok = results.iter().all(|r| r["status"] == "ok");
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };

    (status, Json(json!({ "backends": results })))
}
