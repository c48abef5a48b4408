//! Unified HTTP error taxonomy for axum request handlers (§7).
//!
//! [`AppError`] is a `thiserror` enum whose variants map onto the status-code
//! taxonomy the spec requires: 400 for validation/capability mismatches, 401/403
//! for auth, 429 for admission overload (with `Retry-After`), 502/504 for
//! upstream failures and timeouts, 503 when no healthy backend exists, and 500
//! for anything unexpected. Every handler returns `Result<T, AppError>` and
//! propagates with `?`; [`IntoResponse`] does the status/body mapping once,
//! here, instead of in every handler.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::config::Capability;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("backend overloaded: {backend}/{capability}, retry after {retry_after_secs}s")]
    Overloaded { backend: String, capability: Capability, retry_after_secs: u64 },

    #[error("backend not ready: {backend}")]
    Unavailable { backend: String, health_error: Option<String> },

    /// Heavy-tier agent work shed under load (§4.9) — distinct from
    /// [`Self::Overloaded`], which names a specific backend/capability;
    /// this is a gateway-side capacity decision with no backend involved.
    #[error("heavy agent tier shed under load")]
    ShedHeavy,

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// The HTTP status this error maps to — exposed so the request plane can
    /// log the outcome of a request that failed before a `Response` existed
    /// (e.g. a streaming setup failure recorded in the traffic log).
    pub fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ShedHeavy => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine-readable error type tag, mirrored into streaming error
    /// frames (§7 "streaming errors as a single SSE error frame").
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Overloaded { .. } => "backend_overloaded",
            Self::Unavailable { .. } => "unavailable",
            Self::ShedHeavy => "shed_heavy",
            Self::UpstreamError(_) => "upstream_error",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Render as the single SSE error frame used when a streaming response
    /// fails mid-stream (§7): `{"error":{"message","type","detail"}}`.
    pub fn to_sse_frame(&self) -> bytes::Bytes {
        let value = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "detail": self.to_string(),
            }
        });
        bytes::Bytes::from(format!("data: {value}\n\n"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "handler error");
        } else {
            tracing::debug!(error = %self, "handler rejected request");
        }

        let mut response = match &self {
            // §4.3 mandates this exact shape, not the generic `detail` envelope.
            Self::Overloaded { backend, capability, .. } => (
                status,
                Json(json!({ "error": "backend_overloaded", "backend": backend, "capability": capability })),
            )
                .into_response(),
            // §8 scenario 6 expects this exact shape, not the generic `detail` envelope.
            Self::Unavailable { backend, health_error } => (
                status,
                Json(json!({ "error": "backend_not_ready", "backend": backend, "health_error": health_error })),
            )
                .into_response(),
            // §4.9 mandates this exact shape, not the generic `detail` envelope.
            Self::ShedHeavy => (status, Json(json!({ "error": "shed_heavy" }))).into_response(),
            _ => (status, Json(json!({ "detail": self.to_string() }))).into_response(),
        };

        match &self {
            Self::Overloaded { retry_after_secs, .. } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
            }
            Self::Unavailable { .. } => {
                response.headers_mut().insert("retry-after", HeaderValue::from_static("30"));
            }
            _ => {}
        }

        response
    }
}

/// Convert an admission-control rejection into the 429 response §7 specifies.
impl From<crate::admission::Busy> for AppError {
    fn from(busy: crate::admission::Busy) -> Self {
        Self::Overloaded { backend: busy.backend, capability: busy.capability, retry_after_secs: busy.retry_after_secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        assert_eq!(AppError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn overloaded_maps_to_429() {
        let e = AppError::Overloaded { backend: "gpu_heavy".into(), capability: Capability::Chat, retry_after_secs: 5 };
        assert_eq!(e.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn overloaded_body_names_backend_and_capability() {
        let e = AppError::Overloaded { backend: "gpu_heavy".into(), capability: Capability::Chat, retry_after_secs: 5 };
        let resp = e.into_response();
        assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
    }

    #[test]
    fn shed_heavy_maps_to_429() {
        assert_eq!(AppError::ShedHeavy.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AppError::ShedHeavy.error_type(), "shed_heavy");
    }

    #[test]
    fn unavailable_maps_to_503() {
        let e = AppError::Unavailable { backend: "gpu_heavy".into(), health_error: None };
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn upstream_error_maps_to_502() {
        assert_eq!(AppError::UpstreamError("x".into()).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn upstream_timeout_maps_to_504() {
        assert_eq!(AppError::UpstreamTimeout("x".into()).status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn sse_frame_contains_done_compatible_error_shape() {
        let frame = AppError::UpstreamError("boom".into()).to_sse_frame();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.contains("\"type\":\"upstream_error\""));
    }
}
