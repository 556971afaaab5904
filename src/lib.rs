//! Borealis Query - streaming range-vector aggregation for the Borealis
//! time-series store
//!
//! This crate is the query-execution fragment of a Prometheus-compatible
//! metrics store:
//! - A two-phase map/reduce aggregation pipeline over lazy streams of
//!   range vectors, grouped by label clauses
//! - The aggregator algebra: sum, avg, count, min, max, stddev, stdvar,
//!   quantile (t-digest), group, topk, bottomk, count_values
//! - An execution-plan tree runtime with pluggable dispatch, transformer
//!   chains, unified result schemas, and sample-limit enforcement
//!
//! Storage, query parsing, and the remote transport are external
//! collaborators behind small traits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggr;
pub mod config;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod model;

// Re-export the types most embeddings touch
pub use aggr::{AggregateOperator, AggregationGrouping, RangeVectorAggregator};
pub use config::{PlannerParams, QueryConfig};
pub use error::{QueryError, Result};
pub use exec::{
    print_tree, ExecPlan, ExecResult, QueryContext, QueryResponse, QueryResult, QuerySession,
};
pub use model::{RangeVector, RangeVectorKey, ResultSchema, Row, RowReader, RvRange};
