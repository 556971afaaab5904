//! Non-leaf plan nodes: child dispatch and stream composition
//!
//! A non-leaf node dispatches each child through the child's dispatcher,
//! tags responses with their positional index, folds partial-result flags
//! and stats upward, reduces the children's schemas into one, and hands the
//! surviving child vectors to its `compose` hook. A child failure becomes
//! this node's failure, but in-flight siblings still run to completion:
//! their results are discarded while their stats are accumulated.

use crate::aggr::{AggregateOperator, AggregationGrouping, RangeVectorAggregator};
use crate::error::{QueryError, Result};
use crate::exec::dispatcher::PlanDispatcher;
use crate::exec::plan::{ExecPlan, ExecResult, QueryContext, QueryResponse, QueryResult, QuerySession};
use crate::exec::transformer::RangeVectorTransformer;
use crate::model::{
    reduce_schemas, reduce_schemas_ignoring_shape, stream_from_vectors, RangeVector,
    RangeVectorStream, ResultSchema, RvRange,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::warn;

/// One child's successful response, tagged with its position
#[derive(Debug)]
pub struct ChildResult {
    /// Positional index in the parent's child list; joins depend on this,
    /// never on arrival order
    pub index: usize,
    /// The child's result
    pub result: QueryResult,
}

/// Everything a non-leaf learns from dispatching its children
#[derive(Debug)]
pub struct ChildDispatchOutcome {
    /// Successful child results in positional order
    pub results: Vec<ChildResult>,
    /// Whether any child reported a possibly-partial result
    pub may_be_partial: bool,
    /// First partial-result reason seen
    pub partial_reason: Option<String>,
}

/// Dispatch every child, tagging responses with their index.
///
/// Parallelism is `children.len()` when `parallel` is set, else 1 —
/// sequential dispatch is used to split long-range queries. Each child runs
/// under a fresh session; its reported stats fold into `session`. All
/// children are driven to completion before a failure is surfaced, so the
/// stats of every sibling are accumulated even when the query fails; the
/// first failure by child index becomes the error.
pub async fn dispatch_children(
    children: &[Arc<dyn ExecPlan>],
    session: &Arc<QuerySession>,
    parallel: bool,
) -> Result<ChildDispatchOutcome> {
    async fn dispatch_one(
        index: usize,
        child: Arc<dyn ExecPlan + 'static>,
    ) -> (usize, QueryResponse) {
        let child_session = QuerySession::new();
        let response = child
            .dispatcher()
            .dispatch(Arc::clone(&child), child_session)
            .await;
        (index, response)
    }

    let parallelism = if parallel { children.len().max(1) } else { 1 };
    let futures: Vec<_> = children
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, child)| dispatch_one(index, child))
        .collect();
    let mut tagged = stream::iter(futures).buffered(parallelism);

    let mut results = Vec::with_capacity(children.len());
    let mut may_be_partial = false;
    let mut partial_reason = None;
    let mut first_failure: Option<QueryError> = None;
    while let Some((index, response)) = tagged.next().await {
        match response {
            QueryResponse::Result(result) => {
                session.stats.absorb(&result.stats);
                may_be_partial |= result.may_be_partial;
                if partial_reason.is_none() {
                    partial_reason = result.partial_reason.clone();
                }
                results.push(ChildResult { index, result });
            }
            QueryResponse::Error(e) => {
                session.stats.absorb(&e.stats);
                warn!(
                    query_id = %e.query_id,
                    child = index,
                    error = %e.error,
                    "child plan failed"
                );
                if first_failure.is_none() {
                    first_failure = Some(QueryError::ChildFailure {
                        child: index,
                        message: e.error.to_string(),
                    });
                }
            }
        }
    }
    if let Some(failure) = first_failure {
        return Err(failure);
    }
    Ok(ChildDispatchOutcome {
        results,
        may_be_partial,
        partial_reason,
    })
}

/// Which schema reduction a non-leaf applies over its children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaReducer {
    /// First non-empty schema wins; later non-empty schemas must equal it
    Default,
    /// Column types must match; names are free and fixed vector lengths sum
    /// (used by shard-concatenating plans)
    IgnoreFixedVectorLenAndColumnNames,
}

/// Reduce child schemas, skipping children whose schema is empty
pub fn reduce_child_schemas(
    results: &[ChildResult],
    reducer: SchemaReducer,
) -> Result<ResultSchema> {
    let mut acc = ResultSchema::empty();
    for child in results {
        if child.result.result_schema.is_empty() {
            continue;
        }
        acc = match reducer {
            SchemaReducer::Default => reduce_schemas(acc, &child.result.result_schema)?,
            SchemaReducer::IgnoreFixedVectorLenAndColumnNames => {
                reduce_schemas_ignoring_shape(acc, &child.result.result_schema)?
            }
        };
    }
    Ok(acc)
}

/// The composition hook of non-leaf plans
pub trait NonLeafExecPlan: ExecPlan {
    /// Schema reduction applied over child schemas
    fn schema_reducer(&self) -> SchemaReducer {
        SchemaReducer::Default
    }

    /// Merge the children's vectors into this node's output stream.
    /// Children with empty schemas have already been dropped.
    fn compose(
        &self,
        children: Vec<ChildResult>,
        schema: &ResultSchema,
        session: &Arc<QuerySession>,
    ) -> Result<RangeVectorStream>;
}

/// Shared `do_execute` of non-leaf plans: dispatch, reduce schemas, compose
pub async fn execute_non_leaf<P: NonLeafExecPlan + ?Sized>(
    plan: &P,
    session: Arc<QuerySession>,
) -> Result<ExecResult> {
    let parallel = plan.query_context().planner_params.parallel_child_tasks;
    let children = plan.children();
    let ChildDispatchOutcome {
        results,
        may_be_partial,
        partial_reason,
    } = dispatch_children(&children, &session, parallel).await?;

    let schema = reduce_child_schemas(&results, plan.schema_reducer())?;
    if schema.is_empty() {
        return Ok(ExecResult::empty().with_partial(may_be_partial, partial_reason));
    }

    let survivors: Vec<ChildResult> = results
        .into_iter()
        .filter(|c| !c.result.result_schema.is_empty())
        .collect();
    let stream = plan.compose(survivors, &schema, &session)?;
    Ok(ExecResult::new(schema, stream).with_partial(may_be_partial, partial_reason))
}

/// Flatten child vectors into one stream, positional order preserved
fn concat_child_vectors(children: Vec<ChildResult>) -> RangeVectorStream {
    let mut vectors: Vec<Box<dyn RangeVector>> = Vec::new();
    for child in children {
        for srv in child.result.result {
            vectors.push(Box::new(srv));
        }
    }
    stream_from_vectors(vectors)
}

/// Reduces pre-aggregated child outputs and regroups them.
///
/// Children carry intermediate rows (their leaves ran the map phase), so
/// the composed stream feeds the reduce phase with the map phase skipped.
/// The present phase runs as an `AggregatePresent` transformer, usually on
/// the topmost reducer.
pub struct ReduceAggregateExec {
    context: QueryContext,
    dataset: String,
    dispatcher: Arc<dyn PlanDispatcher>,
    children: Vec<Arc<dyn ExecPlan>>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
    op: AggregateOperator,
    grouping: AggregationGrouping,
    output_range: Option<RvRange>,
}

impl ReduceAggregateExec {
    /// Create a reducer over pre-aggregated children
    pub fn new(
        context: QueryContext,
        dataset: impl Into<String>,
        dispatcher: Arc<dyn PlanDispatcher>,
        children: Vec<Arc<dyn ExecPlan>>,
        op: AggregateOperator,
        grouping: AggregationGrouping,
    ) -> Self {
        Self {
            context,
            dataset: dataset.into(),
            dispatcher,
            children,
            transformers: Vec::new(),
            op,
            grouping,
            output_range: None,
        }
    }

    /// Grid carried on the reduced vectors
    pub fn with_output_range(mut self, range: RvRange) -> Self {
        self.output_range = Some(range);
        self
    }

    /// Append a transformer to this node's chain
    pub fn with_transformer(mut self, transformer: Arc<dyn RangeVectorTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }
}

#[async_trait]
impl ExecPlan for ReduceAggregateExec {
    fn name(&self) -> &'static str {
        "ReduceAggregateExec"
    }

    fn args(&self) -> String {
        format!("aggrOp={}{}", self.op.display(), self.grouping.display())
    }

    fn query_context(&self) -> &QueryContext {
        &self.context
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.children.clone()
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(&self, session: Arc<QuerySession>) -> Result<ExecResult> {
        execute_non_leaf(self, session).await
    }
}

impl NonLeafExecPlan for ReduceAggregateExec {
    fn compose(
        &self,
        children: Vec<ChildResult>,
        _schema: &ResultSchema,
        _session: &Arc<QuerySession>,
    ) -> Result<RangeVectorStream> {
        self.op.validate()?;
        Ok(RangeVectorAggregator::map_reduce(
            self.op.clone(),
            true,
            concat_child_vectors(children),
            self.grouping.clone(),
            num_cpus::get(),
            self.output_range,
        ))
    }
}

/// Concatenates shard outputs without re-aggregating.
///
/// Shards may disagree on column names and grid lengths, so schemas reduce
/// with the shape-ignoring reducer.
pub struct DistConcatExec {
    context: QueryContext,
    dataset: String,
    dispatcher: Arc<dyn PlanDispatcher>,
    children: Vec<Arc<dyn ExecPlan>>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl DistConcatExec {
    /// Create a concatenating node over the given children
    pub fn new(
        context: QueryContext,
        dataset: impl Into<String>,
        dispatcher: Arc<dyn PlanDispatcher>,
        children: Vec<Arc<dyn ExecPlan>>,
    ) -> Self {
        Self {
            context,
            dataset: dataset.into(),
            dispatcher,
            children,
            transformers: Vec::new(),
        }
    }

    /// Append a transformer to this node's chain
    pub fn with_transformer(mut self, transformer: Arc<dyn RangeVectorTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }
}

#[async_trait]
impl ExecPlan for DistConcatExec {
    fn name(&self) -> &'static str {
        "DistConcatExec"
    }

    fn args(&self) -> String {
        format!("children={}", self.children.len())
    }

    fn query_context(&self) -> &QueryContext {
        &self.context
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.children.clone()
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(&self, session: Arc<QuerySession>) -> Result<ExecResult> {
        execute_non_leaf(self, session).await
    }
}

impl NonLeafExecPlan for DistConcatExec {
    fn schema_reducer(&self) -> SchemaReducer {
        SchemaReducer::IgnoreFixedVectorLenAndColumnNames
    }

    fn compose(
        &self,
        children: Vec<ChildResult>,
        _schema: &ResultSchema,
        _session: &Arc<QuerySession>,
    ) -> Result<RangeVectorStream> {
        Ok(concat_child_vectors(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::dispatcher::InProcessDispatcher;
    use crate::exec::plan::QueryStatsSnapshot;
    use crate::model::{MaterializedRangeVector, RangeVectorKey};
    use std::time::Duration;

    /// A child plan yielding one sample row, with optional delay, failure,
    /// and partial flag
    struct StubPlan {
        context: QueryContext,
        dispatcher: Arc<dyn PlanDispatcher>,
        rows_scanned: u64,
        delay_ms: u64,
        fail: bool,
        partial_reason: Option<String>,
    }

    fn stub(
        rows_scanned: u64,
        delay_ms: u64,
        fail: bool,
        partial_reason: Option<&str>,
    ) -> Arc<dyn ExecPlan> {
        Arc::new(StubPlan {
            context: QueryContext::new("stub"),
            dispatcher: InProcessDispatcher::shared(),
            rows_scanned,
            delay_ms,
            fail,
            partial_reason: partial_reason.map(str::to_string),
        })
    }

    #[async_trait]
    impl ExecPlan for StubPlan {
        fn name(&self) -> &'static str {
            "StubPlan"
        }

        fn args(&self) -> String {
            String::new()
        }

        fn query_context(&self) -> &QueryContext {
            &self.context
        }

        fn dataset(&self) -> &str {
            "telemetry"
        }

        fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
            Arc::clone(&self.dispatcher)
        }

        fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
            &[]
        }

        async fn do_execute(&self, session: Arc<QuerySession>) -> Result<ExecResult> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(QueryError::bad_query("stub child failed"));
            }
            session.stats.add_rows_scanned(self.rows_scanned);
            let rv = MaterializedRangeVector::from_samples(
                RangeVectorKey::empty(),
                &[(1000, 1.0)],
                None,
            );
            let exec = ExecResult::new(
                ResultSchema::sample_schema(),
                stream_from_vectors(vec![Box::new(rv)]),
            );
            Ok(exec.with_partial(self.partial_reason.is_some(), self.partial_reason.clone()))
        }
    }

    fn child_result(schema: ResultSchema) -> ChildResult {
        ChildResult {
            index: 0,
            result: QueryResult {
                query_id: "q".to_string(),
                result_schema: schema,
                result: Vec::new(),
                stats: QueryStatsSnapshot::default(),
                may_be_partial: false,
                partial_reason: None,
            },
        }
    }

    #[test]
    fn test_reduce_child_schemas_skips_empty_children() {
        let children = vec![
            child_result(ResultSchema::empty()),
            child_result(ResultSchema::sample_schema()),
            child_result(ResultSchema::sample_schema()),
        ];
        let schema = reduce_child_schemas(&children, SchemaReducer::Default).unwrap();
        assert_eq!(schema, ResultSchema::sample_schema());
    }

    #[test]
    fn test_reduce_child_schemas_rejects_mismatch() {
        let children = vec![
            child_result(ResultSchema::sample_schema()),
            child_result(ResultSchema::histogram_schema()),
        ];
        let err = reduce_child_schemas(&children, SchemaReducer::Default).unwrap_err();
        assert!(matches!(err, QueryError::SchemaMismatch(_)));
    }

    #[test]
    fn test_reduce_child_schemas_ignoring_shape_sums_fixed_len() {
        let mut a = ResultSchema::sample_schema();
        a.fixed_vector_len = Some(10);
        let mut b = ResultSchema::sample_schema();
        b.fixed_vector_len = Some(5);
        b.columns[1].name = "other".to_string();
        let children = vec![child_result(a), child_result(b)];
        let schema = reduce_child_schemas(
            &children,
            SchemaReducer::IgnoreFixedVectorLenAndColumnNames,
        )
        .unwrap();
        assert_eq!(schema.fixed_vector_len, Some(15));
    }

    #[tokio::test]
    async fn test_dispatch_children_tags_in_child_order() {
        let children = vec![
            stub(1, 0, false, None),
            stub(2, 0, false, Some("shard 1 degraded")),
            stub(3, 0, false, None),
        ];
        let session = QuerySession::new();
        let outcome = dispatch_children(&children, &session, true).await.unwrap();

        let indexes: Vec<usize> = outcome.results.iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(outcome.may_be_partial);
        assert_eq!(outcome.partial_reason.as_deref(), Some("shard 1 degraded"));
        assert_eq!(session.stats.snapshot().rows_scanned, 6);
    }

    #[tokio::test]
    async fn test_failed_child_does_not_cancel_inflight_siblings() {
        // child 0 fails immediately; child 2 is slower and completes after
        // the failure has already been seen
        let children = vec![
            stub(0, 0, true, None),
            stub(2, 0, false, None),
            stub(5, 50, false, None),
        ];
        let session = QuerySession::new();
        let err = dispatch_children(&children, &session, true)
            .await
            .unwrap_err();

        match err {
            QueryError::ChildFailure { child, .. } => assert_eq!(child, 0),
            other => panic!("expected ChildFailure, got {other:?}"),
        }
        // the slow sibling was not cancelled: its scan still counts
        assert_eq!(session.stats.snapshot().rows_scanned, 7);
    }

    #[tokio::test]
    async fn test_sequential_dispatch_also_drains_all_children() {
        let children = vec![
            stub(1, 0, true, None),
            stub(4, 0, false, None),
        ];
        let session = QuerySession::new();
        let err = dispatch_children(&children, &session, false)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ChildFailure { child: 0, .. }));
        assert_eq!(session.stats.snapshot().rows_scanned, 4);
    }
}
