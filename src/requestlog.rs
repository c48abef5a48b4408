//! Append-only JSONL request log (§3 `RequestLogEntry`, §4.10).
//!
//! Every completed client-port request is appended as one JSON line when
//! `gateway.request_log_path` is configured. Writes are best-effort: a failed
//! append is logged via `tracing::warn!` and otherwise ignored — a full disk
//! or a permissions problem must never fail the request that triggered it.
//! This mirrors [`crate::tools::ToolBus`]'s own NDJSON audit log.

use serde::Serialize;
use tokio::io::AsyncWriteExt as _;

/// One logged request (§3). Optional fields are only populated when the
/// request reached the point in the pipeline that knows them — e.g. `backend`
/// and `model` are absent for requests rejected before routing.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_out: Option<u64>,
}

impl RequestLogEntry {
    pub fn new(request_id: String, method: String, path: String, status: u16, duration_ms: u64) -> Self {
        Self {
            request_id,
            ts: chrono::Utc::now(),
            method,
            path,
            status,
            duration_ms,
            backend: None,
            model: None,
            reason: None,
            stream: None,
            ttft_ms: None,
            bytes_out: None,
            chunks_out: None,
        }
    }

    pub fn with_route(mut self, backend: impl Into<String>, model: impl Into<String>, reason: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self.model = Some(model.into());
        self.reason = Some(reason.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_stream_stats(mut self, ttft_ms: u64, bytes_out: u64, chunks_out: u64) -> Self {
        self.ttft_ms = Some(ttft_ms);
        self.bytes_out = Some(bytes_out);
        self.chunks_out = Some(chunks_out);
        self
    }
}

/// Durable JSONL sink for [`RequestLogEntry`]. A `None` path disables logging
/// entirely (`append` becomes a no-op) — this is the default, since most
/// deployments rely on `tracing` + the in-memory [`crate::traffic::TrafficLog`]
/// instead of a durable file.
pub struct RequestLog {
    path: Option<String>,
}

impl RequestLog {
    pub fn new(path: Option<String>) -> Self {
        Self { path }
    }

    pub async fn append(&self, entry: &RequestLogEntry) {
        let Some(path) = &self.path else { return };

        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize request log entry");
                return;
            }
        };

        if let Some(parent) = std::path::Path::new(path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, path, "failed to create request log directory");
                return;
            }
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, path, "failed to append request log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_log_is_a_no_op() {
        let log = RequestLog::new(None);
        let entry = RequestLogEntry::new("r1".into(), "POST".into(), "/v1/chat/completions".into(), 200, 5);
        log.append(&entry).await; // must not panic or touch the filesystem
    }

    #[tokio::test]
    async fn appends_one_json_line_per_entry() {
        let dir = std::env::temp_dir().join(format!("lmg-reqlog-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("requests.ndjson");
        let log = RequestLog::new(Some(path.to_string_lossy().into_owned()));

        let e1 = RequestLogEntry::new("r1".into(), "POST".into(), "/v1/chat/completions".into(), 200, 10)
            .with_route("gpu_heavy", "qwen2.5:32b", "policy:fast->alias:fast");
        let e2 = RequestLogEntry::new("r2".into(), "GET".into(), "/v1/models".into(), 200, 1);
        log.append(&e1).await;
        log.append(&e2).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["backend"], "gpu_heavy");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
