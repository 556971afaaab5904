//! Metrics and telemetry for the query engine
//!
//! Prometheus metrics keyed by plan class name and dataset. Emission is
//! fire-and-forget; failures to observe never affect query execution.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};

lazy_static! {
    /// Query execution latency per plan class
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "query_exec_duration_seconds",
        "ExecPlan execute() latency in seconds",
        &["plan", "dataset"],
        vec![0.001, 0.01, 0.05, 0.25, 1.0, 5.0, 30.0]
    )
    .unwrap();

    /// Serialized result size per plan class
    pub static ref RESULT_BYTES: HistogramVec = register_histogram_vec!(
        "query_result_bytes",
        "Serialized result size in bytes",
        &["plan", "dataset"],
        vec![1024.0, 16384.0, 131072.0, 1048576.0, 8388608.0]
    )
    .unwrap();

    /// Total queries per plan class and outcome
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "query_exec_total",
        "Total plan executions",
        &["plan", "status"]
    )
    .unwrap();

    /// Total samples materialized into serialized range vectors
    pub static ref SAMPLES_SERIALIZED: IntCounter = register_int_counter!(
        "query_samples_serialized_total",
        "Samples materialized into serialized range vectors"
    )
    .unwrap();

    /// Queries that completed with the partial-result flag set
    pub static ref PARTIAL_RESULTS: IntCounter = register_int_counter!(
        "query_partial_results_total",
        "Queries completed with partial results"
    )
    .unwrap();
}

/// Render all registered metrics in Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        QUERIES_TOTAL.with_label_values(&["TestExec", "success"]).inc();
        SAMPLES_SERIALIZED.inc_by(42);
        let text = gather();
        assert!(text.contains("query_exec_total"));
        assert!(text.contains("query_samples_serialized_total"));
    }
}
