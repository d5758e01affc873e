//! Cache outcome accounting.
//!
//! One counter family, labeled the way the dashboards expect it:
//! `http_requests_total{statusCode, method, result}` with `result` either
//! `cacheHit` or `cacheMiss`. Recording is best-effort; the request path
//! never waits on metrics.

use std::fmt;

use http::{Method, StatusCode};
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};

const RESULT_CACHE_HIT: &str = "cacheHit";
const RESULT_CACHE_MISS: &str = "cacheMiss";

/// Best-effort sink for cache outcome counters.
pub trait MetricsSink: Send + Sync + 'static {
    /// A response was served from the cache.
    fn cache_hit(&self, method: &Method, status: StatusCode);
    /// A response was captured from the upstream.
    fn cache_miss(&self, method: &Method, status: StatusCode);
}

/// Prometheus-backed [`MetricsSink`], registered against an explicit
/// registry rather than the process-wide default.
pub struct PrometheusSink {
    http_requests: IntCounterVec,
}

impl fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

impl PrometheusSink {
    /// Creates the counter family and registers it with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let http_requests = IntCounterVec::new(
            Opts::new(
                "http_requests_total",
                "Number of http requests by statusCode, http method and result",
            ),
            &["statusCode", "method", "result"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;
        Ok(Self { http_requests })
    }

    fn observe(&self, method: &Method, status: StatusCode, result: &str) {
        self.http_requests
            .with_label_values(&[status.as_str(), method.as_str(), result])
            .inc();
    }
}

impl MetricsSink for PrometheusSink {
    fn cache_hit(&self, method: &Method, status: StatusCode) {
        self.observe(method, status, RESULT_CACHE_HIT);
    }

    fn cache_miss(&self, method: &Method, status: StatusCode) {
        self.observe(method, status, RESULT_CACHE_MISS);
    }
}

/// Discards every observation. Stands in for the real sink in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopSink;

impl MetricsSink for NopSink {
    fn cache_hit(&self, _method: &Method, _status: StatusCode) {}
    fn cache_miss(&self, _method: &Method, _status: StatusCode) {}
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    TextEncoder::new().encode_to_string(&registry.gather())
}
