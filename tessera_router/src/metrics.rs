//! Prometheus metrics for routing and relocation.
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, TextEncoder};

/// Statements dispatched to shards, by operation.
pub static ROUTED_STATEMENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("tessera_routed_statements_total", "Statements dispatched to shards"),
        &["op"]
    )
    .expect("register tessera_routed_statements_total")
});

/// Shard-key updates, by outcome.
pub static RELOCATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("tessera_relocations_total", "Shard-key updates by outcome"),
        &["outcome"]
    )
    .expect("register tessera_relocations_total")
});

/// Wall time of scatter operations.
pub static SCATTER_LATENCY_SECS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("tessera_scatter_latency_seconds", "Scatter-gather latency in seconds")
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]);
    prometheus::register_histogram!(opts).expect("register tessera_scatter_latency_seconds")
});

/// Render every registered metric in the text exposition format.
pub fn render() -> prometheus::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
