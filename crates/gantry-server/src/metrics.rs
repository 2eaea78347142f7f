//! Prometheus-compatible metrics endpoint for the gateway.
//!
//! Tracks request counts, token usage, cost, and the reliability engine's
//! rejection counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Total HTTP requests served.
    http_requests_total: AtomicU64,
    /// Total HTTP errors (4xx + 5xx).
    http_errors_total: AtomicU64,
    /// Non-streaming chat completions.
    chat_completions_total: AtomicU64,
    /// Streaming chat completions.
    chat_streams_total: AtomicU64,
    /// Embedding requests.
    embeddings_total: AtomicU64,
    /// Prompt tokens across all providers.
    prompt_tokens_total: AtomicU64,
    /// Completion tokens across all providers.
    completion_tokens_total: AtomicU64,
    /// Estimated cost in micro-dollars (USD * 1_000_000).
    cost_microdollars_total: AtomicU64,
    /// Requests rejected by the rate limiter.
    rate_limit_rejections_total: AtomicU64,
    /// Requests rejected by an open circuit.
    circuit_open_total: AtomicU64,
    /// Requests that failed over to another provider.
    failover_total: AtomicU64,
    /// Jobs accepted by the overflow queue.
    queue_jobs_total: AtomicU64,
    /// Server start time for uptime calculation.
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                chat_completions_total: AtomicU64::new(0),
                chat_streams_total: AtomicU64::new(0),
                embeddings_total: AtomicU64::new(0),
                prompt_tokens_total: AtomicU64::new(0),
                completion_tokens_total: AtomicU64::new(0),
                cost_microdollars_total: AtomicU64::new(0),
                rate_limit_rejections_total: AtomicU64::new(0),
                circuit_open_total: AtomicU64::new(0),
                failover_total: AtomicU64::new(0),
                queue_jobs_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_completions(&self) {
        self.inner.chat_completions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_streams(&self) {
        self.inner.chat_streams_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_embeddings(&self) {
        self.inner.embeddings_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage(&self, prompt_tokens: u32, completion_tokens: u32, cost: Option<f64>) {
        self.inner
            .prompt_tokens_total
            .fetch_add(prompt_tokens as u64, Ordering::Relaxed);
        self.inner
            .completion_tokens_total
            .fetch_add(completion_tokens as u64, Ordering::Relaxed);
        if let Some(cost) = cost {
            let micro = (cost * 1_000_000.0) as u64;
            self.inner.cost_microdollars_total.fetch_add(micro, Ordering::Relaxed);
        }
    }

    pub fn inc_rate_limit_rejections(&self) {
        self.inner.rate_limit_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_open(&self) {
        self.inner.circuit_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failover(&self) {
        self.inner.failover_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_jobs(&self) {
        self.inner.queue_jobs_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Render all counters in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let i = &self.inner;
        let mut out = String::with_capacity(1024);
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            "gantry_http_requests_total",
            "Total HTTP requests served",
            i.http_requests_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_http_errors_total",
            "Total HTTP error responses",
            i.http_errors_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_chat_completions_total",
            "Non-streaming chat completions",
            i.chat_completions_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_chat_streams_total",
            "Streaming chat completions",
            i.chat_streams_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_embeddings_total",
            "Embedding requests",
            i.embeddings_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_prompt_tokens_total",
            "Prompt tokens across providers",
            i.prompt_tokens_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_completion_tokens_total",
            "Completion tokens across providers",
            i.completion_tokens_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_cost_microdollars_total",
            "Estimated cost in micro-dollars",
            i.cost_microdollars_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_rate_limit_rejections_total",
            "Requests rejected by the rate limiter",
            i.rate_limit_rejections_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_circuit_open_total",
            "Requests rejected by an open circuit",
            i.circuit_open_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_failover_total",
            "Requests that failed over to another provider",
            i.failover_total.load(Ordering::Relaxed),
        );
        counter(
            "gantry_queue_jobs_total",
            "Jobs accepted by the overflow queue",
            i.queue_jobs_total.load(Ordering::Relaxed),
        );
        let uptime = self.uptime_secs();
        out.push_str(&format!(
            "# HELP gantry_uptime_seconds Server uptime\n# TYPE gantry_uptime_seconds gauge\ngantry_uptime_seconds {uptime}\n"
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
