//! Execution-plan nodes and the shared execute pipeline
//!
//! An `ExecPlan` node produces a lazy range-vector stream plus its result
//! schema (`do_execute`), then the shared pipeline folds the node's
//! transformer chain over the stream and materializes the outcome into
//! serialized range vectors under the query's sample limit. Any error along
//! the way is captured into a `QueryErrorResponse` with the stats
//! accumulated so far, so callers always receive a `QueryResponse`.

use crate::config::PlannerParams;
use crate::error::{QueryError, Result};
use crate::exec::dispatcher::PlanDispatcher;
use crate::exec::transformer::{resolve_func_args, RangeVectorTransformer};
use crate::metrics;
use crate::model::{
    empty_stream, RangeVectorStream, RecordBuilder, ResultSchema, SerializedRangeVector,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-query context shared by every node of one plan tree
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Caller-assigned query id, echoed in every response
    pub query_id: String,
    /// Submission time in epoch milliseconds; the timeout clock starts here
    pub submit_time_ms: i64,
    /// Planner-chosen limits for this query
    pub planner_params: PlannerParams,
}

impl QueryContext {
    /// Create a context submitted now with default planner params
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            submit_time_ms: now_ms(),
            planner_params: PlannerParams::default(),
        }
    }

    /// Override the planner params
    pub fn with_planner_params(mut self, params: PlannerParams) -> Self {
        self.planner_params = params;
        self
    }

    /// Milliseconds since submission
    pub fn elapsed_ms(&self) -> u64 {
        (now_ms() - self.submit_time_ms).max(0) as u64
    }

    /// Fail when the query has been running past its timeout. Checked at
    /// pipeline step boundaries; long-running `do_execute` bodies re-check.
    pub fn check_timeout(&self) -> Result<()> {
        let elapsed_ms = self.elapsed_ms();
        if elapsed_ms >= self.planner_params.query_timeout_ms {
            Err(QueryError::Timeout {
                elapsed_ms,
                timeout_ms: self.planner_params.query_timeout_ms,
            })
        } else {
            Ok(())
        }
    }
}

/// Atomic per-query counters, advanced while the pipeline runs
#[derive(Debug, Default)]
pub struct QueryStats {
    result_bytes: AtomicU64,
    samples_serialized: AtomicU64,
    rows_scanned: AtomicU64,
}

impl QueryStats {
    /// Count serialized result bytes (containers plus key sizes)
    pub fn add_result_bytes(&self, bytes: u64) {
        self.result_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count samples materialized into serialized vectors
    pub fn add_samples_serialized(&self, samples: u64) {
        self.samples_serialized.fetch_add(samples, Ordering::Relaxed);
    }

    /// Count raw rows read from sources
    pub fn add_rows_scanned(&self, rows: u64) {
        self.rows_scanned.fetch_add(rows, Ordering::Relaxed);
    }

    /// Fold a child's reported counters into this query's totals
    pub fn absorb(&self, other: &QueryStatsSnapshot) {
        self.add_result_bytes(other.result_bytes);
        self.add_samples_serialized(other.samples_serialized);
        self.add_rows_scanned(other.rows_scanned);
    }

    /// Read a consistent-enough copy of the counters
    pub fn snapshot(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            result_bytes: self.result_bytes.load(Ordering::Relaxed),
            samples_serialized: self.samples_serialized.load(Ordering::Relaxed),
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data copy of [`QueryStats`], carried in responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatsSnapshot {
    /// Serialized result bytes
    pub result_bytes: u64,
    /// Samples materialized
    pub samples_serialized: u64,
    /// Raw rows read from sources
    pub rows_scanned: u64,
}

/// Mutable state of one query execution, shared across its tasks
#[derive(Debug, Default)]
pub struct QuerySession {
    /// Counters for this (sub-)query
    pub stats: QueryStats,
}

impl QuerySession {
    /// Fresh session with zeroed stats
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Output of `do_execute`: the result schema plus the lazy row stream, and
/// partial-result flags gathered from children
pub struct ExecResult {
    /// Schema of the rows in `stream`
    pub schema: ResultSchema,
    /// Lazy stream of range vectors
    pub stream: RangeVectorStream,
    /// Some shard's data is known to be missing
    pub may_be_partial: bool,
    /// Why the result may be partial
    pub partial_reason: Option<String>,
}

impl ExecResult {
    /// A complete (non-partial) result
    pub fn new(schema: ResultSchema, stream: RangeVectorStream) -> Self {
        Self {
            schema,
            stream,
            may_be_partial: false,
            partial_reason: None,
        }
    }

    /// The empty result: empty schema, no vectors
    pub fn empty() -> Self {
        Self::new(ResultSchema::empty(), empty_stream())
    }

    /// Attach partial-result flags
    pub fn with_partial(mut self, may_be_partial: bool, reason: Option<String>) -> Self {
        self.may_be_partial = may_be_partial;
        self.partial_reason = reason;
        self
    }
}

/// A successful query response
#[derive(Debug)]
pub struct QueryResult {
    /// Query id from the context
    pub query_id: String,
    /// Schema of the serialized vectors
    pub result_schema: ResultSchema,
    /// The materialized result
    pub result: Vec<SerializedRangeVector>,
    /// Counters accumulated while executing
    pub stats: QueryStatsSnapshot,
    /// Some shard's data is known to be missing
    pub may_be_partial: bool,
    /// Why the result may be partial
    pub partial_reason: Option<String>,
}

/// A failed query response; stats reflect work done before the failure
#[derive(Debug)]
pub struct QueryErrorResponse {
    /// Query id from the context
    pub query_id: String,
    /// Counters accumulated before the failure
    pub stats: QueryStatsSnapshot,
    /// What went wrong
    pub error: QueryError,
}

/// Every execution terminates in exactly one of these
#[derive(Debug)]
pub enum QueryResponse {
    /// The query produced a result
    Result(QueryResult),
    /// The query failed
    Error(QueryErrorResponse),
}

impl QueryResponse {
    /// The result, when successful
    pub fn result(&self) -> Option<&QueryResult> {
        match self {
            QueryResponse::Result(r) => Some(r),
            QueryResponse::Error(_) => None,
        }
    }

    /// The error, when failed
    pub fn error(&self) -> Option<&QueryError> {
        match self {
            QueryResponse::Result(_) => None,
            QueryResponse::Error(e) => Some(&e.error),
        }
    }
}

/// One node of an execution-plan tree
#[async_trait]
pub trait ExecPlan: Send + Sync {
    /// Plan class name, used in plan printing and metrics
    fn name(&self) -> &'static str;

    /// Human-readable arguments for plan printing
    fn args(&self) -> String;

    /// The query context shared by this plan tree
    fn query_context(&self) -> &QueryContext;

    /// Dataset this plan reads
    fn dataset(&self) -> &str;

    /// Where this plan executes when dispatched by a parent
    fn dispatcher(&self) -> Arc<dyn PlanDispatcher>;

    /// Child plans, dispatched by non-leaf nodes
    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        Vec::new()
    }

    /// Ordered transformer chain applied after `do_execute`
    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>];

    /// Whether materialization enforces the sample limit
    fn enforce_limit(&self) -> bool {
        true
    }

    /// Produce this node's row stream and schema
    async fn do_execute(&self, session: Arc<QuerySession>) -> Result<ExecResult>;

    /// Run the full pipeline: `do_execute`, the transformer chain, and
    /// materialization. Never panics the caller; failures become
    /// [`QueryErrorResponse`].
    async fn execute(&self, session: Arc<QuerySession>) -> QueryResponse {
        let started = Instant::now();
        let outcome = run_pipeline(self, Arc::clone(&session)).await;
        metrics::QUERY_DURATION
            .with_label_values(&[self.name(), self.dataset()])
            .observe(started.elapsed().as_secs_f64());

        let query_id = self.query_context().query_id.clone();
        match outcome {
            Ok(result) => {
                metrics::QUERIES_TOTAL
                    .with_label_values(&[self.name(), "success"])
                    .inc();
                if result.may_be_partial {
                    metrics::PARTIAL_RESULTS.inc();
                }
                debug!(
                    query_id = %query_id,
                    plan = self.name(),
                    vectors = result.result.len(),
                    "query completed"
                );
                QueryResponse::Result(result)
            }
            Err(error) => {
                metrics::QUERIES_TOTAL
                    .with_label_values(&[self.name(), "error"])
                    .inc();
                warn!(query_id = %query_id, plan = self.name(), error = %error, "query failed");
                QueryResponse::Error(QueryErrorResponse {
                    query_id,
                    stats: session.stats.snapshot(),
                    error,
                })
            }
        }
    }
}

/// The shared execute pipeline behind [`ExecPlan::execute`]
async fn run_pipeline<P: ExecPlan + ?Sized>(
    plan: &P,
    session: Arc<QuerySession>,
) -> Result<QueryResult> {
    let ctx = plan.query_context();

    // step 1: schema + stream, gated on the timeout
    ctx.check_timeout()?;
    let exec_result = plan.do_execute(Arc::clone(&session)).await?;
    let ExecResult {
        mut schema,
        mut stream,
        may_be_partial,
        partial_reason,
    } = exec_result;

    // step 2: transformer chain, gated again
    ctx.check_timeout()?;
    let sample_limit = ctx.planner_params.sample_limit;
    for transformer in plan.transformers() {
        if schema.is_empty() && !transformer.can_handle_empty_schemas() {
            continue;
        }
        let params = resolve_func_args(transformer.func_args(), &session).await?;
        let (next_stream, next_schema) = transformer.apply(
            stream,
            &schema,
            Arc::clone(&session),
            sample_limit,
            &params,
        )?;
        stream = next_stream;
        schema = next_schema;
    }

    if schema.is_empty() {
        return Ok(QueryResult {
            query_id: ctx.query_id.clone(),
            result_schema: schema,
            result: Vec::new(),
            stats: session.stats.snapshot(),
            may_be_partial,
            partial_reason,
        });
    }

    // materialize, enforcing the sample limit
    let enforce = plan.enforce_limit() && ctx.planner_params.enforce_sample_limit;
    let builder = RecordBuilder::shared();
    let mut result = Vec::new();
    let mut total_samples = 0usize;
    while let Some(rv) = stream.next().await {
        let rv = rv?;
        let srv = SerializedRangeVector::materialize(rv.as_ref(), &builder, &schema, plan.name())?;
        total_samples += srv.num_rows_serialized();
        if enforce && total_samples > sample_limit {
            return Err(QueryError::SampleLimitExceeded {
                limit: sample_limit,
                actual: total_samples,
            });
        }
        if srv.num_rows_serialized() > 0 {
            result.push(srv);
        }
    }

    let key_bytes: usize = result.iter().map(|srv| srv.key_size_bytes()).sum();
    let result_bytes = (builder.read().total_bytes() + key_bytes) as u64;
    session.stats.add_result_bytes(result_bytes);
    session.stats.add_samples_serialized(total_samples as u64);
    metrics::SAMPLES_SERIALIZED.inc_by(total_samples as u64);
    metrics::RESULT_BYTES
        .with_label_values(&[plan.name(), plan.dataset()])
        .observe(result_bytes as f64);

    Ok(QueryResult {
        query_id: ctx.query_id.clone(),
        result_schema: schema,
        result,
        stats: session.stats.snapshot(),
        may_be_partial,
        partial_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_and_absorb() {
        let stats = QueryStats::default();
        stats.add_result_bytes(100);
        stats.add_samples_serialized(10);
        let child = QueryStatsSnapshot {
            result_bytes: 50,
            samples_serialized: 5,
            rows_scanned: 7,
        };
        stats.absorb(&child);
        let snap = stats.snapshot();
        assert_eq!(snap.result_bytes, 150);
        assert_eq!(snap.samples_serialized, 15);
        assert_eq!(snap.rows_scanned, 7);
    }

    #[test]
    fn test_timeout_check() {
        let ctx = QueryContext::new("q1")
            .with_planner_params(PlannerParams::new().with_query_timeout_ms(0));
        assert!(ctx.check_timeout().unwrap_err().is_timeout());

        let ctx = QueryContext::new("q2");
        assert!(ctx.check_timeout().is_ok());
    }

    #[test]
    fn test_exec_result_partial_flags() {
        let result = ExecResult::empty().with_partial(true, Some("shard 3 timed out".into()));
        assert!(result.may_be_partial);
        assert_eq!(result.partial_reason.as_deref(), Some("shard 3 timed out"));
    }
}
