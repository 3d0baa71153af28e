//! Metrics collection for the metadata and block services
//!
//! Request counts, failures and latencies per RPC method, exposed through
//! Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

use crate::error::Result;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Requests served, by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Requests answered with an error, by method and error kind
    pub static ref REQ_FAILURE_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("request_failure_counter", "request failure counter"),
        &["method", "kind"]
    )
    .unwrap();

    /// Handler latency, by method
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_FAILURE_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
}

fn error_kind(e: &crate::error::Error) -> &'static str {
    use crate::error::Error::*;
    match e {
        StaleTerm { .. } => "stale_term",
        LogMismatch { .. } => "log_mismatch",
        StaleLog { .. } => "stale_log",
        VersionConflict(_) => "version_conflict",
        Unavailable(_) => "unavailable",
        MissingBlock(_) => "missing_block",
        NotLeader => "not_leader",
        Io(_) => "io",
        Codec(_) => "codec",
        Config(_) => "config",
    }
}

/// Runs `handler`, counting the call and its failure kind and timing it.
pub async fn record_metrics<F, Fut, T>(method_name: &'static str, handler: F) -> Result<T>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T>> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());
    if let Err(e) = &result {
        REQ_FAILURE_COUNTER_VEC
            .with_label_values(&[method_name, error_kind(e)])
            .inc();
    }

    result
}
