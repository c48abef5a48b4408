//! In-memory traffic log exposed through the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume, and complements the durable
//! append-only [`crate::requestlog::RequestLog`] with a view the admin API can
//! read without touching disk.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();

        let mut backend_counts: HashMap<String, usize> = HashMap::new();
        for entry in entries.iter() {
            if let Some(backend) = &entry.backend {
                *backend_counts.entry(backend.clone()).or_default() += 1;
            }
        }

        TrafficStats {
            total_requests: total,
            error_count,
            avg_latency_ms,
            backend_counts,
        }
    }
}

/// A single request record (§3, generalizing the teacher's tier/profile shape
/// to the router's `(backend, upstream_model, reason)` decision).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique request ID.
    pub id: String,
    /// Timestamp of the request.
    pub timestamp: DateTime<Utc>,
    /// Request path, e.g. `/v1/chat/completions`.
    pub path: String,
    /// Original model alias or name from the request body.
    pub requested_model: Option<String>,
    /// Backend that handled this request — absent if routing never completed.
    pub backend: Option<String>,
    /// Upstream model name actually dispatched.
    pub upstream_model: Option<String>,
    /// Routing rule that decided this request (`RouteDecision::reason`).
    pub reason: Option<String>,
    /// Whether the response was streamed via SSE.
    pub stream: bool,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Whether the request completed successfully.
    pub success: bool,
    /// Error description when `success` is `false`.
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(path: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            path,
            requested_model: None,
            backend: None,
            upstream_model: None,
            reason: None,
            stream: false,
            latency_ms,
            success,
            error: None,
        }
    }

    /// Attach the original model hint from the request.
    pub fn with_requested_model(mut self, model: impl Into<String>) -> Self {
        self.requested_model = Some(model.into());
        self
    }

    /// Attach the resolved route (backend, upstream model, reason).
    pub fn with_route(mut self, backend: impl Into<String>, upstream_model: impl Into<String>, reason: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self.upstream_model = Some(upstream_model.into());
        self.reason = Some(reason.into());
        self
    }

    /// Mark this entry as a streamed response.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Attach an error description for failed requests.
    pub fn with_error(mut self, err: impl Into<String>) -> Self {
        self.error = Some(err.into());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub avg_latency_ms: f64,
    pub backend_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(backend: &str, latency_ms: u64) -> TrafficEntry {
        TrafficEntry::new("/v1/chat/completions".into(), latency_ms, true).with_route(backend, "some-model", "policy:fast")
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry("gpu_heavy", 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].backend.as_deref(), Some("gpu_heavy"));
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 1));
        log.push(make_entry("b", 2));
        log.push(make_entry("c", 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].backend.as_deref(), Some("c"));
        assert_eq!(recent[1].backend.as_deref(), Some("b"));
        assert_eq!(recent[2].backend.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn recent_limits_result_count() {
        let log = TrafficLog::new(20);
        for i in 0..10u64 {
            log.push(make_entry("a", i));
        }
        let recent = log.recent(3).await;
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry("oldest", 1));
        log.push(make_entry("middle", 2));
        log.push(make_entry("newest", 3));
        log.push(make_entry("extra", 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.backend.as_deref() == Some("oldest")));
        assert!(all.iter().any(|e| e.backend.as_deref() == Some("extra")));
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = TrafficLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        assert!(stats.backend_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_averages_latency_correctly() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 100));
        log.push(make_entry("a", 200));
        log.push(make_entry("b", 300));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_counts_requests_per_backend() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", 10));
        log.push(make_entry("a", 20));
        log.push(make_entry("b", 30));

        let stats = log.stats().await;
        assert_eq!(stats.backend_counts["a"], 2);
        assert_eq!(stats.backend_counts["b"], 1);
    }

    #[tokio::test]
    async fn stats_counts_errors_separately_from_success() {
        let log = TrafficLog::new(10);
        log.push(TrafficEntry::new("/v1/chat/completions".into(), 5, false).with_error("upstream_error"));
        log.push(make_entry("a", 5));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.error_count, 1);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry("a", 1);
        let b = make_entry("a", 1);
        assert_ne!(a.id, b.id, "every entry must have a unique UUID");
    }

    #[test]
    fn entry_records_success_flag() {
        let ok = TrafficEntry::new("/v1/chat/completions".into(), 0, true);
        let err = TrafficEntry::new("/v1/chat/completions".into(), 0, false);
        assert!(ok.success);
        assert!(!err.success);
    }
}
