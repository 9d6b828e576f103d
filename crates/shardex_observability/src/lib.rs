//! Observability setup: structured logging and engine metrics.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardex=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Record one per-shard statement execution.
/// `kind` is one of: "rows", "scalar", "aggregate".
pub fn record_shard_query(kind: &'static str, duration_us: u64, success: bool) {
    metrics::counter!(
        "shardex_shard_queries_total",
        "kind" => kind,
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("shardex_shard_query_duration_us", "kind" => kind)
        .record(duration_us as f64);
}

/// Record a pool acquire that had to queue behind other callers.
pub fn record_pool_wait(data_source: &str) {
    metrics::counter!("shardex_pool_waits_total", "data_source" => data_source.to_string())
        .increment(1);
}

/// Record the strategy chosen for a frozen plan.
pub fn record_strategy(strategy: &'static str) {
    metrics::counter!("shardex_strategy_selected_total", "strategy" => strategy).increment(1);
}

/// Record rows materialized at the coordinator by a merge step.
pub fn record_rows_buffered(strategy: &'static str, rows: usize) {
    metrics::histogram!("shardex_rows_buffered", "strategy" => strategy).record(rows as f64);
}
