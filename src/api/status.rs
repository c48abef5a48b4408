//! Health and gateway-status endpoints (§4.10, §6).
//!
//! `GET /health` / `HEAD /health` are unauthenticated liveness probes — the
//! process answers as long as it's alive, with no backend dependency, and
//! `HEAD` is free since axum's `get()` method router derives it automatically
//! by running the handler and discarding the body. `GET /health/upstreams`
//! and `GET /v1/gateway/status` are bearer-protected and expose per-backend
//! health plus admission headroom.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::{config::Capability, router::AppState};

/// `GET /health`, `HEAD /health` — unauthenticated liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /health/upstreams` (bearer) — per-backend liveness/readiness detail.
pub async fn health_upstreams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses = state.health.all_status();
    Json(json!({ "backends": statuses }))
}

/// `GET /v1/gateway/status` (bearer) — admission headroom per `(backend,
/// capability)` plus backend health and process uptime.
pub async fn gateway_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config();
    let uptime_secs = state.started_at.elapsed().as_secs();

    let capabilities = [
        Capability::Chat,
        Capability::Embeddings,
        Capability::Images,
        Capability::Music,
        Capability::Tts,
    ];

    let mut admission = Vec::new();
    for (backend_id, backend_cfg) in &config.backends {
        for capability in capabilities {
            if !backend_cfg.supports(capability) {
                continue;
            }
            if let Some(available) = state.admission.available(backend_id, capability) {
                admission.push(json!({
                    "backend": backend_id,
                    "capability": capability.to_string(),
                    "available": available,
                }));
            }
        }
    }

    let body = json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "backends": state.health.all_status(),
        "admission": admission,
    });
    Json(body)
}

/// Unauthenticated routes — mounted without the bearer/IP/rate-limit layers.
pub fn public_router(state: Arc<AppState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Bearer-protected routes — mounted alongside the rest of the client surface.
pub fn protected_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/upstreams", get(health_upstreams))
        .route("/v1/gateway/status", get(gateway_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{router::AppState, traffic::TrafficLog};

    fn minimal_config() -> crate::config::Config {
        let backend = crate::config::BackendConfig {
            base_url: "http://127.0.0.1:11434".into(),
            description: None,
            api_key_env: None,
            timeout_ms: 1000,
            provider: crate::config::Provider::Ndjson,
            capabilities: vec![crate::config::Capability::Chat],
            concurrency_limits: std::collections::HashMap::new(),
            liveness_path: "/".into(),
            readiness_path: None,
            default_model: "qwen2.5:32b".into(),
            fast_model: None,
            legacy_aliases: vec![],
            payload_policy: std::collections::HashMap::new(),
        };
        let mut backends = std::collections::HashMap::new();
        backends.insert("gpu_heavy".to_string(), backend);

        crate::config::Config {
            gateway: crate::config::GatewayConfig {
                client_port: 8080,
                admin_port: 8081,
                traffic_log_capacity: 100,
                log_level: None,
                bearer_tokens_env: "AI_GATEWAY_TEST_TOKENS_STATUS".into(),
                token_policies_env: None,
                ip_allowlist: String::new(),
                max_request_bytes: 1_000_000,
                rate_limit_rpm: None,
                admin_token_env: None,
                request_log_path: None,
            },
            backends,
            router: crate::config::RouterConfig { default_backend: "gpu_heavy".into(), ..Default::default() },
            aliases: std::collections::HashMap::new(),
            tools: crate::config::ToolsConfig::default(),
            memory: crate::config::MemoryConfig::default(),
            agent: crate::config::AgentConfig::default(),
            images: crate::config::ImagesConfig::default(),
            clients: vec![],
        }
    }

    fn minimal_state() -> Arc<AppState> {
        let config = Arc::new(minimal_config());
        Arc::new(
            AppState::new(config, std::path::PathBuf::from("test.toml"), Arc::new(TrafficLog::new(100))).unwrap(),
        )
    }

    #[tokio::test]
    async fn health_returns_ok_without_auth() {
        let app = public_router(minimal_state());
        let req = Request::builder().method("GET").uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn head_health_succeeds_with_no_body() {
        let app = public_router(minimal_state());
        let req = Request::builder().method("HEAD").uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gateway_status_reports_uptime_and_empty_backends() {
        let app = protected_router(minimal_state());
        let req = Request::builder().method("GET").uri("/v1/gateway/status").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["backends"].as_array().unwrap().is_empty());
    }
}
