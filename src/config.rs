//! Configuration for the query engine
//!
//! Engine-wide settings with serde defaults and builder-style overrides.
//! The struct mirrors the configuration keys the engine actually consumes;
//! file loading and environment overrides live with the embedding server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Engine-wide query configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// How long a dispatcher waits for a dispatched plan before giving up
    #[serde(default = "default_ask_timeout", with = "duration_ms")]
    pub ask_timeout: Duration,

    /// Samples older than this are considered stale by sources (milliseconds)
    #[serde(default = "default_stale_sample_after_ms")]
    pub stale_sample_after_ms: i64,

    /// Minimum accepted step for an output grid (milliseconds)
    #[serde(default = "default_min_step_ms")]
    pub min_step_ms: i64,

    /// Cap on windows processed by the in-memory fast-reduce path
    #[serde(default = "default_fastreduce_max_windows")]
    pub fastreduce_max_windows: usize,

    /// Query language frontend to use (consumed by the parser, not the engine)
    #[serde(default = "default_parser")]
    pub parser: String,

    /// Convert Prometheus-style bucket series into native histogram columns
    /// at the source
    #[serde(default = "default_true")]
    pub translate_prom_histograms: bool,

    /// Opaque routing subtree, interpreted by the dispatcher layer
    #[serde(default)]
    pub routing: serde_json::Value,

    /// Named feature flags; anything not present is off
    #[serde(default)]
    pub features: HashMap<String, bool>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            ask_timeout: default_ask_timeout(),
            stale_sample_after_ms: default_stale_sample_after_ms(),
            min_step_ms: default_min_step_ms(),
            fastreduce_max_windows: default_fastreduce_max_windows(),
            parser: default_parser(),
            translate_prom_histograms: default_true(),
            routing: serde_json::Value::Null,
            features: HashMap::new(),
        }
    }
}

impl QueryConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatcher ask timeout
    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    /// Set the staleness horizon in milliseconds
    pub fn with_stale_sample_after_ms(mut self, ms: i64) -> Self {
        self.stale_sample_after_ms = ms;
        self
    }

    /// Set the minimum grid step in milliseconds
    pub fn with_min_step_ms(mut self, ms: i64) -> Self {
        self.min_step_ms = ms.max(1);
        self
    }

    /// Enable a named feature flag
    pub fn with_feature(mut self, name: impl Into<String>) -> Self {
        self.features.insert(name.into(), true);
        self
    }

    /// Feature-flag lookup; unknown flags default to false
    pub fn has(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

/// Per-query planner parameters, carried inside the query context
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerParams {
    /// Query timeout in milliseconds, checked at pipeline step boundaries
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Maximum number of samples a query may materialize
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,

    /// Whether the sample limit is enforced during materialization
    #[serde(default = "default_true")]
    pub enforce_sample_limit: bool,

    /// Dispatch children with parallelism children.len() instead of 1.
    /// Sequential dispatch is used to split long-range queries.
    #[serde(default = "default_true")]
    pub parallel_child_tasks: bool,
}

impl Default for PlannerParams {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            sample_limit: default_sample_limit(),
            enforce_sample_limit: default_true(),
            parallel_child_tasks: default_true(),
        }
    }
}

impl PlannerParams {
    /// Create planner params with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the query timeout in milliseconds
    pub fn with_query_timeout_ms(mut self, ms: u64) -> Self {
        self.query_timeout_ms = ms;
        self
    }

    /// Set the sample limit
    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    /// Disable sample-limit enforcement
    pub fn without_sample_limit(mut self) -> Self {
        self.enforce_sample_limit = false;
        self
    }

    /// Dispatch children one at a time
    pub fn sequential_child_tasks(mut self) -> Self {
        self.parallel_child_tasks = false;
        self
    }
}

fn default_ask_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_sample_after_ms() -> i64 {
    300_000
}

fn default_min_step_ms() -> i64 {
    1
}

fn default_fastreduce_max_windows() -> usize {
    50
}

fn default_parser() -> String {
    "promql".to_string()
}

fn default_true() -> bool {
    true
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_sample_limit() -> usize {
    1_000_000
}

/// Serde adapter storing Durations as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = QueryConfig::default();
        assert_eq!(config.ask_timeout, Duration::from_secs(30));
        assert_eq!(config.stale_sample_after_ms, 300_000);
        assert_eq!(config.min_step_ms, 1);
        assert_eq!(config.fastreduce_max_windows, 50);
        assert_eq!(config.parser, "promql");
        assert!(config.translate_prom_histograms);
    }

    #[test]
    fn test_feature_flags_default_off() {
        let config = QueryConfig::default().with_feature("shard-key-routing");
        assert!(config.has("shard-key-routing"));
        assert!(!config.has("anything-else"));
    }

    #[test]
    fn test_planner_params_builder() {
        let params = PlannerParams::new()
            .with_query_timeout_ms(5_000)
            .with_sample_limit(100)
            .sequential_child_tasks();
        assert_eq!(params.query_timeout_ms, 5_000);
        assert_eq!(params.sample_limit, 100);
        assert!(!params.parallel_child_tasks);
        assert!(params.enforce_sample_limit);
    }

    #[test]
    fn test_config_roundtrip() {
        let json = r#"{"ask_timeout": 10000, "parser": "logql"}"#;
        let config: QueryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ask_timeout, Duration::from_secs(10));
        assert_eq!(config.parser, "logql");
        assert_eq!(config.min_step_ms, 1);
    }
}
