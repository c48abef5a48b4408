//! Client-port authentication (§4.10): a bearer token set with per-token
//! policy overrides, plus the global/per-token IP allowlist.
//!
//! Generalizes the teacher's `client_auth.rs` (a single `[[clients]]` key →
//! profile map) into a token *set* sourced from `[gateway].bearer_tokens_env`
//! (a comma-separated list, per the teacher's own `bearer_tokens` design),
//! enriched with per-token [`TokenPolicy`] overrides from two sources that are
//! merged together: `token_policies_env` (a JSON object keyed by token value,
//! for env-only deployments) and `[[clients]]` entries (the teacher's config
//! shape, for deployments that prefer a static file). A request's resolved
//! policy is injected as a request extension so downstream middleware (IP
//! allowlist, rate limiting) and handlers (tool dispatch) can read it without
//! re-parsing the `Authorization` header.
//!
//! When `bearer_tokens_env` resolves to no tokens at all, auth is disabled —
//! matching the teacher's no-op-when-unconfigured behavior — and the global
//! IP allowlist still applies to every request.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::Context as _;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use ipnet::IpNet;
use serde::Deserialize;

use crate::{config::Config, router::AppState};

/// Per-token policy override (§3 `ClientConfig` generalized to env-sourced tokens).
#[derive(Debug, Clone, Default)]
pub struct TokenPolicy {
    /// `None` means "fall back to the global allowlist"; `Some(vec![])` means
    /// this token has no IP restriction even if the global allowlist is set.
    pub ip_allowlist: Option<Vec<IpNet>>,
    pub tools_allowlist: Vec<String>,
    pub rate_limit_rpm: Option<u32>,
}

/// Injected as a request extension once a bearer token resolves successfully.
#[derive(Clone)]
pub struct AuthenticatedClient {
    pub token: String,
    pub policy: Arc<TokenPolicy>,
}

#[derive(Deserialize)]
struct RawTokenPolicy {
    #[serde(default)]
    ip_allowlist: Option<String>,
    #[serde(default)]
    tools_allowlist: Vec<String>,
    #[serde(default)]
    rate_limit_rpm: Option<u32>,
}

/// Resolved set of accepted bearer tokens and their policies, built once at
/// startup. Not hot-reloaded — rotating a token requires a process restart,
/// matching [`crate::router::AppState::replace_config`]'s scope (routing
/// knobs only, not identity/capacity).
pub struct AuthRegistry {
    tokens: HashMap<String, Arc<TokenPolicy>>,
    global_ip_allowlist: Vec<IpNet>,
}

impl AuthRegistry {
    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let mut tokens: HashMap<String, Arc<TokenPolicy>> = HashMap::new();

        if let Ok(raw) = std::env::var(&config.gateway.bearer_tokens_env) {
            for tok in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                tokens.entry(tok.to_string()).or_insert_with(|| Arc::new(TokenPolicy::default()));
            }
        }

        if let Some(env_name) = &config.gateway.token_policies_env {
            if let Ok(raw) = std::env::var(env_name) {
                let parsed: HashMap<String, RawTokenPolicy> =
                    serde_json::from_str(&raw).with_context(|| format!("parsing {env_name} as a token policy map"))?;
                for (tok, raw_policy) in parsed {
                    let ip_allowlist = match raw_policy.ip_allowlist {
                        Some(s) => Some(parse_allowlist(&s)?),
                        None => None,
                    };
                    tokens.insert(
                        tok,
                        Arc::new(TokenPolicy {
                            ip_allowlist,
                            tools_allowlist: raw_policy.tools_allowlist,
                            rate_limit_rpm: raw_policy.rate_limit_rpm,
                        }),
                    );
                }
            }
        }

        for client in &config.clients {
            let Ok(tok) = std::env::var(&client.key_env) else {
                tracing::warn!(key_env = %client.key_env, "[[clients]] entry's key_env is unset — token not registered");
                continue;
            };
            let ip_allowlist = match &client.ip_allowlist {
                Some(s) => Some(parse_allowlist(s)?),
                None => None,
            };
            tokens.insert(
                tok,
                Arc::new(TokenPolicy {
                    ip_allowlist,
                    tools_allowlist: client.tools_allowlist.clone(),
                    rate_limit_rpm: client.rate_limit_rpm,
                }),
            );
        }

        let global_ip_allowlist = parse_allowlist(&config.gateway.ip_allowlist)?;

        Ok(Self { tokens, global_ip_allowlist })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn resolve(&self, token: &str) -> Option<Arc<TokenPolicy>> {
        self.tokens.get(token).cloned()
    }

    /// Check `ip` against `policy`'s override if present, else the global allowlist.
    /// An empty allowlist (either way) means "no restriction".
    pub fn ip_allowed(&self, policy: Option<&TokenPolicy>, ip: IpAddr) -> bool {
        let list = policy
            .and_then(|p| p.ip_allowlist.as_ref())
            .unwrap_or(&self.global_ip_allowlist);
        list.is_empty() || list.iter().any(|net| net.contains(&ip))
    }
}

fn parse_allowlist(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if let Ok(net) = s.parse::<IpNet>() {
                return Ok(net);
            }
            let ip: IpAddr = s.parse().with_context(|| format!("invalid IP/CIDR `{s}` in allowlist"))?;
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            Ok(IpNet::new(ip, prefix).expect("host prefix is always valid"))
        })
        .collect()
}

/// Axum middleware: requires a valid `Authorization: Bearer <token>` header
/// when any tokens are registered, and injects an [`AuthenticatedClient`]
/// extension with the token's resolved policy.
pub async fn bearer_auth_middleware(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    if state.auth.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided.and_then(|token| state.auth.resolve(token).map(|policy| (token.to_string(), policy))) {
        Some((token, policy)) => {
            req.extensions_mut().insert(AuthenticatedClient { token, policy });
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"ai-gateway\"")],
            "Valid client API key required.",
        )
            .into_response(),
    }
}

/// Axum middleware: enforces the IP allowlist (per-token override, else
/// global). Runs after [`bearer_auth_middleware`] so a resolved token's
/// override is available via the [`AuthenticatedClient`] extension.
pub async fn ip_allowlist_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

    let policy = req.extensions().get::<AuthenticatedClient>().map(|c| c.policy.as_ref());

    if state.auth.ip_allowed(policy, ip) {
        next.run(req).await
    } else {
        (StatusCode::FORBIDDEN, "Client IP not in allowlist.").into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::Ipv4Addr};

    use super::*;
    use crate::config::{BackendConfig, Capability, GatewayConfig, Provider, RouterConfig};

    fn config_with(bearer_env: &str, ip_allowlist: &str) -> Config {
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
                bearer_tokens_env: bearer_env.into(),
                token_policies_env: None,
                ip_allowlist: ip_allowlist.into(),
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
    fn no_tokens_configured_means_auth_disabled() {
        std::env::remove_var("AUTH_TEST_EMPTY");
        let cfg = config_with("AUTH_TEST_EMPTY", "");
        let registry = AuthRegistry::load(&cfg).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn bearer_tokens_env_registers_tokens_with_default_policy() {
        std::env::set_var("AUTH_TEST_TOKENS", "tok-a, tok-b");
        let cfg = config_with("AUTH_TEST_TOKENS", "");
        let registry = AuthRegistry::load(&cfg).unwrap();
        assert!(registry.resolve("tok-a").is_some());
        assert!(registry.resolve("tok-b").is_some());
        assert!(registry.resolve("tok-c").is_none());
    }

    #[test]
    fn token_policies_env_overlays_a_policy_onto_a_registered_token() {
        std::env::set_var("AUTH_TEST_TOKENS2", "tok-a");
        std::env::set_var("AUTH_TEST_POLICIES", r#"{"tok-a":{"rate_limit_rpm":5,"tools_allowlist":["shell"]}}"#);
        let mut cfg = config_with("AUTH_TEST_TOKENS2", "");
        cfg.gateway.token_policies_env = Some("AUTH_TEST_POLICIES".into());
        let registry = AuthRegistry::load(&cfg).unwrap();
        let policy = registry.resolve("tok-a").unwrap();
        assert_eq!(policy.rate_limit_rpm, Some(5));
        assert_eq!(policy.tools_allowlist, vec!["shell".to_string()]);
    }

    #[test]
    fn global_allowlist_blocks_ips_outside_the_cidr() {
        let cfg = config_with("AUTH_TEST_NONE", "10.0.0.0/8");
        let registry = AuthRegistry::load(&cfg).unwrap();
        assert!(registry.ip_allowed(None, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(!registry.ip_allowed(None, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let cfg = config_with("AUTH_TEST_NONE2", "");
        let registry = AuthRegistry::load(&cfg).unwrap();
        assert!(registry.ip_allowed(None, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))));
    }

    #[test]
    fn per_token_override_replaces_the_global_allowlist() {
        let policy = TokenPolicy {
            ip_allowlist: Some(vec!["192.168.0.0/16".parse().unwrap()]),
            tools_allowlist: vec![],
            rate_limit_rpm: None,
        };
        let cfg = config_with("AUTH_TEST_NONE3", "10.0.0.0/8");
        let registry = AuthRegistry::load(&cfg).unwrap();
        assert!(registry.ip_allowed(Some(&policy), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!registry.ip_allowed(Some(&policy), IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))));
    }
}
