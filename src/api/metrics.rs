//! Prometheus-compatible `/metrics` endpoint (§4.11).
//!
//! Rendering lives in [`crate::metrics::Metrics`], which owns the counters
//! and histograms directly — this handler only adds the HTTP framing. The
//! sliding-window traffic view (recent entries, aggregate error rate) is a
//! separate concern served at `/admin/traffic`.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse};

use crate::router::AppState;

/// `GET /metrics` (bearer) — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], state.metrics.render())
}
