//! Bearer-token authentication middleware for the admin API.
//!
//! When `admin_token_env` is configured in `[gateway]`, all admin routes
//! require an `Authorization: Bearer <token>` header. Requests with a missing
//! or incorrect token are rejected with `401 Unauthorized`.
//!
//! When `admin_token_env` is absent the middleware is a no-op — admin auth is
//! disabled. This is acceptable when the admin port is strictly firewalled to
//! trusted hosts only.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::router::AppState;

/// Axum middleware: requires a valid `Authorization: Bearer <token>` header
/// on every admin route when `gateway.admin_token_env` resolves to a value.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state
        .config()
        .gateway
        .admin_token_env
        .as_ref()
        .and_then(|env| std::env::var(env).ok())
    else {
        // Auth disabled — pass through.
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"ai-gateway admin\"")],
            "Invalid admin token.",
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"ai-gateway admin\"")],
            "Admin API requires Authorization: Bearer <token>.",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Router};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::{BackendConfig, Capability, Config, GatewayConfig, Provider, RouterConfig},
        traffic::TrafficLog,
    };

    fn config(admin_token_env: Option<&str>) -> Config {
        let mut concurrency = HashMap::new();
        concurrency.insert(Capability::Chat, 1);
        let backend = BackendConfig {
            base_url: "http://127.0.0.1:11434".into(),
            description: None,
            api_key_env: None,
            timeout_ms: 1000,
            provider: Provider::Ndjson,
            capabilities: vec![Capability::Chat],
            concurrency_limits: concurrency,
            liveness_path: "/".into(),
            readiness_path: None,
            default_model: "qwen2.5:32b".into(),
            fast_model: None,
            legacy_aliases: vec![],
            payload_policy: HashMap::new(),
        };
        let mut backends = HashMap::new();
        backends.insert("gpu_heavy".to_string(), backend);

        Config {
            gateway: GatewayConfig {
                client_port: 8080,
                admin_port: 8081,
                traffic_log_capacity: 10,
                log_level: None,
                bearer_tokens_env: "ADMIN_AUTH_TEST_UNSET".into(),
                token_policies_env: None,
                ip_allowlist: String::new(),
                max_request_bytes: 1000,
                rate_limit_rpm: None,
                admin_token_env: admin_token_env.map(String::from),
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

    fn state(admin_token_env: Option<&str>) -> Arc<AppState> {
        let cfg = Arc::new(config(admin_token_env));
        Arc::new(AppState::new(cfg, std::path::PathBuf::default(), Arc::new(TrafficLog::new(10))).unwrap())
    }

    async fn ok() -> &'static str {
        "ok"
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/", get(ok))
            .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn disabled_when_admin_token_env_unset() {
        let resp = app(state(None)).oneshot(HttpRequest::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_token_passes() {
        std::env::set_var("ADMIN_AUTH_TEST_TOKEN_A", "s3cret");
        let resp = app(state(Some("ADMIN_AUTH_TEST_TOKEN_A")))
            .oneshot(HttpRequest::get("/").header("authorization", "Bearer s3cret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_token_rejected() {
        std::env::set_var("ADMIN_AUTH_TEST_TOKEN_B", "s3cret");
        let resp = app(state(Some("ADMIN_AUTH_TEST_TOKEN_B")))
            .oneshot(HttpRequest::get("/").header("authorization", "Bearer nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_token_rejected() {
        std::env::set_var("ADMIN_AUTH_TEST_TOKEN_C", "s3cret");
        let resp = app(state(Some("ADMIN_AUTH_TEST_TOKEN_C")))
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
