//! Admission Controller (§4.2).
//!
//! Bounds in-flight work per `(backend, capability)` pair using one
//! `tokio::sync::Semaphore` per key, sized from
//! `BackendConfig.concurrency_limits`. Unlike a queueing limiter, admission
//! here is fail-fast: a request that can't immediately acquire a permit is
//! rejected with 429 + `Retry-After` rather than waiting in line. This
//! generalizes the teacher's per-IP token-bucket [`crate::api::rate_limit::RateLimiter`]
//! (itself a `DashMap<IpAddr, Bucket>`) from a refill-based limiter keyed by
//! client IP to a permit-based limiter keyed by where the request is going.
//!
//! Permits are held for the duration of the upstream call, including
//! streaming — see [`Permit`], whose `Drop` releases the slot as soon as the
//! response (or the client) goes away, so a cancelled stream doesn't leak
//! capacity.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::{
    backends::SseStream,
    config::{BackendConfig, Capability, Config},
};

/// Key identifying one admission-controlled resource.
pub type AdmissionKey = (String, Capability);

/// A held admission permit. Dropping it releases the slot immediately.
pub struct Permit {
    _inner: tokio::sync::OwnedSemaphorePermit,
}

/// Returned when a slot cannot be granted right now.
#[derive(Debug, Clone)]
pub struct Busy {
    pub backend: String,
    pub capability: Capability,
    /// Suggested `Retry-After` value in seconds.
    pub retry_after_secs: u64,
}

/// Per-(backend,capability) bounded admission state.
///
/// Cheap to clone — semaphores live behind `Arc` inside the map, and the map
/// itself is rebuilt (not mutated in place) whenever the config reloads with
/// different concurrency limits, so in-flight permits from the old table
/// remain valid until their requests complete.
#[derive(Clone)]
pub struct AdmissionController {
    semaphores: Arc<DashMap<AdmissionKey, Arc<Semaphore>>>,
    /// Fixed backoff hint surfaced to clients on rejection. The controller
    /// does no actual queueing, so this is a constant, not a measured value.
    retry_after_secs: u64,
}

impl AdmissionController {
    /// Build one semaphore per declared `(backend, capability)` pair.
    pub fn from_config(config: &Config) -> Self {
        let semaphores = Arc::new(DashMap::new());
        for (backend_id, backend) in &config.backends {
            for cap in &backend.capabilities {
                let limit = capacity_for(backend, *cap);
                semaphores.insert((backend_id.clone(), *cap), Arc::new(Semaphore::new(limit)));
            }
        }
        Self {
            semaphores,
            retry_after_secs: 5,
        }
    }

    /// Attempt to acquire one slot for `(backend, capability)` without
    /// waiting. Unknown keys (a capability the backend never declared) are
    /// treated as unlimited — the router should never route there in the
    /// first place, but admission itself doesn't need to re-validate routing.
    pub fn try_acquire(&self, backend_id: &str, capability: Capability) -> Result<Permit, Busy> {
        let key = (backend_id.to_string(), capability);
        let Some(sem) = self.semaphores.get(&key).map(|e| e.clone()) else {
            return Ok(Permit {
                _inner: unlimited_permit(),
            });
        };
        match sem.try_acquire_owned() {
            Ok(inner) => Ok(Permit { _inner: inner }),
            Err(TryAcquireError::NoPermits) => Err(Busy {
                backend: backend_id.to_string(),
                capability,
                retry_after_secs: self.retry_after_secs,
            }),
            Err(TryAcquireError::Closed) => Err(Busy {
                backend: backend_id.to_string(),
                capability,
                retry_after_secs: self.retry_after_secs,
            }),
        }
    }

    /// Current available permits for a key, for `/v1/gateway/status` reporting.
    pub fn available(&self, backend_id: &str, capability: Capability) -> Option<usize> {
        self.semaphores
            .get(&(backend_id.to_string(), capability))
            .map(|e| e.available_permits())
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

/// Wraps a streaming response with its admission [`Permit`] so the slot is
/// released exactly when the stream ends or is dropped (client disconnect,
/// timeout) — never held open past that point, and never released early
/// while bytes are still being forwarded.
struct GuardedStream {
    inner: SseStream,
    _permit: Permit,
}

impl Stream for GuardedStream {
    type Item = anyhow::Result<bytes::Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Attach a permit to a backend stream so dropping or exhausting the stream
/// releases the admission slot.
pub fn guard_stream(stream: SseStream, permit: Permit) -> SseStream {
    Box::pin(GuardedStream { inner: stream, _permit: permit })
}

fn capacity_for(backend: &BackendConfig, cap: Capability) -> usize {
    backend.concurrency_limits.get(&cap).copied().unwrap_or(1).max(1)
}

/// A permit from a semaphore with capacity 1 that is immediately forgotten,
/// used as a placeholder for keys with no declared limit. Since nothing else
/// ever acquires against this semaphore, `forget` here never under-counts a
/// real resource.
fn unlimited_permit() -> tokio::sync::OwnedSemaphorePermit {
    let sem = Arc::new(Semaphore::new(1));
    sem.try_acquire_owned().expect("fresh semaphore has a permit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Provider};
    use std::collections::HashMap;

    fn config_with_limit(limit: usize) -> Config {
        let mut concurrency = HashMap::new();
        concurrency.insert(Capability::Chat, limit);
        let backend = BackendConfig {
            base_url: "http://x".into(),
            description: None,
            api_key_env: None,
            timeout_ms: 1000,
            provider: Provider::OpenAI,
            capabilities: vec![Capability::Chat],
            concurrency_limits: concurrency,
            liveness_path: "/".into(),
            readiness_path: None,
            default_model: "m".into(),
            fast_model: None,
            legacy_aliases: vec![],
            payload_policy: HashMap::new(),
        };
        let mut backends = HashMap::new();
        backends.insert("b1".to_string(), backend);
        Config {
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
            aliases: HashMap::new(),
            tools: Default::default(),
            memory: Default::default(),
            agent: Default::default(),
            images: Default::default(),
            clients: vec![],
        }
    }

    #[test]
    fn acquires_up_to_configured_limit_then_rejects() {
        let controller = AdmissionController::from_config(&config_with_limit(2));
        let p1 = controller.try_acquire("b1", Capability::Chat);
        let p2 = controller.try_acquire("b1", Capability::Chat);
        let p3 = controller.try_acquire("b1", Capability::Chat);
        assert!(p1.is_ok());
        assert!(p2.is_ok());
        assert!(p3.is_err());
    }

    #[test]
    fn dropping_a_permit_frees_a_slot() {
        let controller = AdmissionController::from_config(&config_with_limit(1));
        let p1 = controller.try_acquire("b1", Capability::Chat).unwrap();
        assert!(controller.try_acquire("b1", Capability::Chat).is_err());
        drop(p1);
        assert!(controller.try_acquire("b1", Capability::Chat).is_ok());
    }

    #[test]
    fn unknown_capability_is_unlimited() {
        let controller = AdmissionController::from_config(&config_with_limit(1));
        assert!(controller.try_acquire("b1", Capability::Embeddings).is_ok());
        assert!(controller.try_acquire("b1", Capability::Embeddings).is_ok());
    }

    #[test]
    fn available_reports_remaining_permits() {
        let controller = AdmissionController::from_config(&config_with_limit(3));
        assert_eq!(controller.available("b1", Capability::Chat), Some(3));
        let _p = controller.try_acquire("b1", Capability::Chat).unwrap();
        assert_eq!(controller.available("b1", Capability::Chat), Some(2));
    }

    #[test]
    fn busy_carries_retry_after_hint() {
        let controller = AdmissionController::from_config(&config_with_limit(1));
        let _p1 = controller.try_acquire("b1", Capability::Chat).unwrap();
        let err = controller.try_acquire("b1", Capability::Chat).unwrap_err();
        assert_eq!(err.retry_after_secs, 5);
        assert_eq!(err.backend, "b1");
        assert_eq!(err.capability, Capability::Chat);
    }
}
