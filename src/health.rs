//! Health Gate (§4.1).
//!
//! A background task periodically probes every backend's liveness path and,
//! only if liveness succeeds, its readiness path. Results are kept in a
//! `RwLock<HashMap<..>>` that the router consults before dispatching — a
//! backend that hasn't been ready on its last probe is skipped (§4.5 rule 0)
//! rather than tried and left to time out.
//!
//! Before the first probe completes for a backend, [`HealthGate::is_ready`]
//! answers optimistically (`true`) — grounded in the original's
//! `HealthChecker.is_ready`, which defaults to ready so a cold-started
//! gateway doesn't refuse all traffic before its first probe tick.

use std::{collections::HashMap, sync::RwLock, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;

/// Point-in-time health record for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: String,
    pub healthy: bool,
    pub ready: bool,
    pub last_check: DateTime<Utc>,
    pub error: Option<String>,
}

/// Shared, lock-protected health table plus the HTTP client used to probe it.
pub struct HealthGate {
    status: RwLock<HashMap<String, BackendHealth>>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthGate {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            status: RwLock::new(HashMap::new()),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            timeout,
        })
    }

    /// Probe every backend in `config` once, concurrently, and update the
    /// shared table. Intended to be called on a fixed interval from a
    /// `tokio::spawn`ed loop (see [`run_forever`]).
    pub async fn check_all(&self, config: &Config) {
        let checks = config
            .backends
            .iter()
            .map(|(id, backend)| self.check_one(id.clone(), backend.base_url.clone(), backend.liveness_path.clone(), backend.readiness_path().to_string()));
        let results: Vec<BackendHealth> = futures_util::future::join_all(checks).await;

        let mut table = self.status.write().expect("health table lock poisoned");
        for result in results {
            if !result.ready {
                tracing::warn!(
                    backend = %result.backend,
                    healthy = result.healthy,
                    error = ?result.error,
                    "backend not ready"
                );
            }
            table.insert(result.backend.clone(), result);
        }
    }

    async fn check_one(
        &self,
        backend_id: String,
        base_url: String,
        liveness_path: String,
        readiness_path: String,
    ) -> BackendHealth {
        let base = base_url.trim_end_matches('/');
        let mut healthy = false;
        let mut ready = false;
        let mut error = None;

        match self.client.get(format!("{base}{liveness_path}")).send().await {
            Ok(resp) => healthy = resp.status().is_success(),
            Err(e) => error = Some(format!("liveness check failed: {e}")),
        }

        if healthy {
            match self.client.get(format!("{base}{readiness_path}")).send().await {
                Ok(resp) => ready = resp.status().is_success(),
                Err(e) => error = Some(format!("readiness check failed: {e}")),
            }
        }

        BackendHealth {
            backend: backend_id,
            healthy,
            ready,
            last_check: Utc::now(),
            error,
        }
    }

    /// Whether `backend_id` may currently be routed to. Optimistic (`true`)
    /// until the first probe completes.
    pub fn is_ready(&self, backend_id: &str) -> bool {
        self.status
            .read()
            .expect("health table lock poisoned")
            .get(backend_id)
            .map(|s| s.ready)
            .unwrap_or(true)
    }

    pub fn status_for(&self, backend_id: &str) -> Option<BackendHealth> {
        self.status.read().expect("health table lock poisoned").get(backend_id).cloned()
    }

    pub fn all_status(&self) -> Vec<BackendHealth> {
        self.status.read().expect("health table lock poisoned").values().cloned().collect()
    }
}

/// Runs [`HealthGate::check_all`] on a fixed interval until the process
/// exits. Errors from an individual probe never abort the loop — a single
/// flaky backend shouldn't stop health gating for the rest.
pub async fn run_forever(gate: std::sync::Arc<HealthGate>, config: std::sync::Arc<RwLock<std::sync::Arc<Config>>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = config.read().expect("config lock poisoned").clone();
        gate.check_all(&snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn backend_with_no_probe_yet_is_optimistically_ready() {
        let gate = HealthGate::new(Duration::from_secs(1)).unwrap();
        assert!(gate.is_ready("unknown-backend"));
    }

    #[tokio::test]
    async fn healthy_and_ready_backend_reports_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let gate = HealthGate::new(Duration::from_secs(1)).unwrap();
        let result = gate.check_one("b1".into(), server.uri(), "/".into(), "/".into()).await;
        assert!(result.healthy);
        assert!(result.ready);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn failing_liveness_marks_backend_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let gate = HealthGate::new(Duration::from_secs(1)).unwrap();
        let result = gate.check_one("b1".into(), server.uri(), "/".into(), "/".into()).await;
        assert!(!result.healthy);
        assert!(!result.ready);
    }

    #[tokio::test]
    async fn readiness_only_checked_when_liveness_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/live")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        Mock::given(method("GET")).and(path("/ready")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let gate = HealthGate::new(Duration::from_secs(1)).unwrap();
        let result = gate.check_one("b1".into(), server.uri(), "/live".into(), "/ready".into()).await;
        assert!(result.healthy);
        assert!(!result.ready);
    }

    #[tokio::test]
    async fn check_all_updates_shared_table_for_known_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let mut backends = std::collections::HashMap::new();
        backends.insert(
            "b1".to_string(),
            crate::config::BackendConfig {
                base_url: server.uri(),
                description: None,
                api_key_env: None,
                timeout_ms: 1000,
                provider: crate::config::Provider::OpenAI,
                capabilities: vec![crate::config::Capability::Chat],
                concurrency_limits: std::collections::HashMap::from([(crate::config::Capability::Chat, 1)]),
                liveness_path: "/".into(),
                readiness_path: None,
                default_model: "m".into(),
                fast_model: None,
                legacy_aliases: vec![],
                payload_policy: std::collections::HashMap::new(),
            },
        );
        let config = Config {
            gateway: crate::config::GatewayConfig {
                client_port: 1,
                admin_port: 2,
                traffic_log_capacity: 1,
                log_level: None,
                bearer_tokens_env: "T".into(),
                token_policies_env: None,
                ip_allowlist: String::new(),
                max_request_bytes: 1,
                rate_limit_rpm: None,
                admin_token_env: None,
                request_log_path: None,
            },
            backends,
            router: crate::config::RouterConfig {
                default_backend: "b1".into(),
                ..Default::default()
            },
            aliases: std::collections::HashMap::new(),
            tools: Default::default(),
            memory: Default::default(),
            agent: Default::default(),
            images: Default::default(),
            clients: vec![],
        };

        let gate = HealthGate::new(Duration::from_secs(1)).unwrap();
        gate.check_all(&config).await;
        assert!(gate.is_ready("b1"));
        assert!(gate.status_for("b1").is_some());
    }
}
