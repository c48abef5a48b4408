//! Process-wide Prometheus metrics (§4.11), generalizing the teacher's
//! sliding-window-only `/admin/metrics` exporter into monotonic counters and
//! histograms that live for the lifetime of the process rather than rotating
//! out of a fixed-size ring buffer. The ring buffer (`traffic.rs`) still backs
//! `/admin/traffic` for recent-request inspection; this module answers "how
//! many, how slow, since start" questions that a sliding window can't.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Millisecond histogram bucket upper bounds, matching the default Prometheus
/// client library buckets trimmed to the latency range this gateway cares
/// about (sub-second to multi-minute long-context generations).
const DURATION_BUCKETS_MS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0, 120_000.0,
];

#[derive(Default)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: DURATION_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_ms: u64) {
        for (bound, bucket) in DURATION_BUCKETS_MS.iter().zip(&self.buckets) {
            if value_ms as f64 <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide request metrics, shared via `Arc` in [`crate::router::AppState`].
pub struct Metrics {
    requests_total: DashMap<(String, String, u16), AtomicU64>,
    duration_ms: DashMap<String, Histogram>,
    ttft_ms: DashMap<String, Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: DashMap::new(),
            duration_ms: DashMap::new(),
            ttft_ms: DashMap::new(),
        }
    }

    /// Record one completed request.
    pub fn record_request(&self, path: &str, method: &str, status: u16, duration_ms: u64) {
        self.requests_total
            .entry((path.to_string(), method.to_string(), status))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.duration_ms.entry(path.to_string()).or_insert_with(Histogram::new).observe(duration_ms);
    }

    /// Record a streaming response's time-to-first-token.
    pub fn record_ttft(&self, path: &str, ttft_ms: u64) {
        self.ttft_ms.entry(path.to_string()).or_insert_with(Histogram::new).observe(ttft_ms);
    }

    /// Render all metrics in Prometheus text exposition format (§4.11).
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# HELP gateway_requests_total Total requests processed, by path/method/status.\n");
        out.push_str("# TYPE gateway_requests_total counter\n");
        let mut rows: Vec<_> = self.requests_total.iter().map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed))).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        for ((path, method, status), count) in rows {
            out.push_str(&format!(
                "gateway_requests_total{{path=\"{path}\",method=\"{method}\",status=\"{status}\"}} {count}\n"
            ));
        }
        out.push('\n');

        render_histogram(&mut out, "gateway_request_duration_ms", "Request duration in milliseconds.", &self.duration_ms);
        render_histogram(&mut out, "gateway_ttft_ms", "Time to first streamed token, in milliseconds.", &self.ttft_ms);

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, histograms: &DashMap<String, Histogram>) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} histogram\n"));
    let mut labels: Vec<_> = histograms.iter().map(|e| e.key().clone()).collect();
    labels.sort();
    for path in labels {
        let Some(hist) = histograms.get(&path) else { continue };
        for (bound, bucket) in DURATION_BUCKETS_MS.iter().zip(&hist.buckets) {
            let count = bucket.load(Ordering::Relaxed);
            out.push_str(&format!("{name}_bucket{{path=\"{path}\",le=\"{bound}\"}} {count}\n"));
        }
        out.push_str(&format!("{name}_bucket{{path=\"{path}\",le=\"+Inf\"}} {}\n", hist.count.load(Ordering::Relaxed)));
        out.push_str(&format!("{name}_sum{{path=\"{path}\"}} {}\n", hist.sum_ms.load(Ordering::Relaxed)));
        out.push_str(&format!("{name}_count{{path=\"{path}\"}} {}\n", hist.count.load(Ordering::Relaxed)));
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders_request_counts() {
        let metrics = Metrics::new();
        metrics.record_request("/v1/chat/completions", "POST", 200, 42);
        metrics.record_request("/v1/chat/completions", "POST", 200, 58);
        metrics.record_request("/v1/chat/completions", "POST", 429, 1);

        let out = metrics.render();
        assert!(out.contains("gateway_requests_total{path=\"/v1/chat/completions\",method=\"POST\",status=\"200\"} 2"));
        assert!(out.contains("gateway_requests_total{path=\"/v1/chat/completions\",method=\"POST\",status=\"429\"} 1"));
    }

    #[test]
    fn duration_histogram_accumulates_sum_and_count() {
        let metrics = Metrics::new();
        metrics.record_request("/v1/chat/completions", "POST", 200, 100);
        metrics.record_request("/v1/chat/completions", "POST", 200, 200);
        let out = metrics.render();
        assert!(out.contains("gateway_request_duration_ms_sum{path=\"/v1/chat/completions\"} 300"));
        assert!(out.contains("gateway_request_duration_ms_count{path=\"/v1/chat/completions\"} 2"));
    }

    #[test]
    fn ttft_histogram_is_tracked_separately_from_duration() {
        let metrics = Metrics::new();
        metrics.record_ttft("/v1/chat/completions", 15);
        let out = metrics.render();
        assert!(out.contains("gateway_ttft_ms_count{path=\"/v1/chat/completions\"} 1"));
        assert!(!out.contains("gateway_request_duration_ms_count{path=\"/v1/chat/completions\"} 1"));
    }
}
