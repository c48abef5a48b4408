//! Token-bucket rate limiting middleware.
//!
//! One bucket per key — the authenticated bearer token when auth is enabled,
//! else the client IP. Tokens refill steadily at `rpm / 60` tokens/second and
//! the burst cap is `ceil(rpm / 2)` — enough to absorb short spikes without
//! allowing runaway bursts. The limiter only exists at all when
//! `gateway.rate_limit_rpm` is configured (`AppState::rate_limiter` is
//! `None` otherwise); a per-token `TokenPolicy::rate_limit_rpm` narrows or
//! widens the limit for that token while the feature is enabled, but cannot
//! turn it on by itself (DESIGN.md).
//!
//! When a request is rejected the response includes:
//! - `429 Too Many Requests`
//! - `Retry-After: <seconds>` — exact wait before the bucket has a token again
//! - `X-RateLimit-Limit: <rpm>` — limit applied to this key
//! - `X-RateLimit-Policy: <N>;w=60` — standard hint: N requests per 60-second window

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::{api::auth::AuthenticatedClient, router::AppState};

/// Per-key token bucket state. `rpm` is pinned at bucket creation — in
/// practice a key's effective limit doesn't change mid-flight (token
/// policies are loaded once at startup).
#[derive(Debug, Clone)]
struct Bucket {
    last_refill: Instant,
    tokens: f64,
    rpm: u32,
}

/// Shared rate limiter: one token bucket per key (bearer token or IP).
pub struct RateLimiter {
    default_rpm: u32,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given default requests-per-minute limit.
    pub fn new(default_rpm: u32) -> Self {
        Self { default_rpm, buckets: DashMap::new() }
    }

    /// Attempt to consume one token for `key`, using `rpm_override` in place
    /// of the default limit when present.
    ///
    /// Returns `Ok(())` if the request is allowed, or `Err((retry_after_secs, rpm))`
    /// if the bucket is empty.
    pub fn check(&self, key: &str, rpm_override: Option<u32>) -> Result<(), (f64, u32)> {
        let rpm = rpm_override.unwrap_or(self.default_rpm).max(1);
        let capacity = ((rpm + 1) / 2) as f64;
        let fill_rate = rpm as f64 / 60.0;
        let now = Instant::now();

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket { last_refill: now, tokens: capacity, rpm });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let new_tokens = (bucket.tokens + elapsed * fill_rate).min(capacity);

        if new_tokens < 1.0 {
            let retry_after = (1.0 - new_tokens) / fill_rate;
            return Err((retry_after.ceil(), rpm));
        }

        bucket.last_refill = now;
        bucket.tokens = new_tokens - 1.0;
        bucket.rpm = rpm;
        Ok(())
    }
}

/// Axum middleware that enforces per-key rate limits.
///
/// No-ops (passes through) when `state.rate_limiter` is `None`. Keys on the
/// authenticated token when present (using its `TokenPolicy::rate_limit_rpm`
/// override), else the client IP from `ConnectInfo` — falling back to
/// `127.0.0.1` when unavailable (e.g. in tests).
pub async fn rate_limit_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let (key, rpm_override) = match req.extensions().get::<AuthenticatedClient>() {
            Some(client) => (client.token.clone(), client.policy.rate_limit_rpm),
            None => {
                let ip = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|c| c.0.ip())
                    .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
                (ip.to_string(), None)
            }
        };

        if let Err((retry_after, rpm)) = limiter.check(&key, rpm_override) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("retry-after", retry_after.to_string()),
                    ("x-ratelimit-limit", rpm.to_string()),
                    ("x-ratelimit-policy", format!("{rpm};w=60")),
                    ("content-type", "text/plain".into()),
                ],
                "Rate limit exceeded. Please retry after the indicated delay.",
            )
                .into_response();
        }
    }

    next.run(req).await
}
