//! Range-vector transformers and function arguments
//!
//! A transformer is a stage applied after `do_execute` that rewrites both
//! the stream and its schema. The grouped aggregation runs as two
//! transformers: `AggregateMapReduce` does the map+reduce phases (map on
//! leaves, reduce-only at composing nodes), `AggregatePresent` translates
//! reduced intermediates into the user-visible series at the top of the
//! tree.
//!
//! Scalar operator parameters may come from nested sub-plans
//! (`FuncArg::Plan`); those dispatch before the transformer applies and
//! reduce to a single scalar, NaN when the sub-plan returned nothing.

use crate::aggr::{AggregateOperator, AggregationGrouping, RangeVectorAggregator};
use crate::error::Result;
use crate::exec::plan::{ExecPlan, QueryResponse, QuerySession};
use crate::model::{RangeVectorStream, ResultSchema, RowReader, RvRange};
use std::sync::Arc;
use tracing::debug;

/// A stage that rewrites a range-vector stream and its schema
pub trait RangeVectorTransformer: Send + Sync {
    /// Transformer class name for plan printing
    fn name(&self) -> &'static str;

    /// Human-readable arguments for plan printing
    fn args(&self) -> String;

    /// Whether this stage still applies when the current schema is empty.
    /// Stages that cannot are skipped on empty schemas.
    fn can_handle_empty_schemas(&self) -> bool {
        false
    }

    /// Parameters to resolve before `apply`; sub-plan parameters dispatch
    /// their plan here
    fn func_args(&self) -> &[FuncArg] {
        &[]
    }

    /// Rewrite the stream, returning the new stream and its schema
    fn apply(
        &self,
        input: RangeVectorStream,
        input_schema: &ResultSchema,
        session: Arc<QuerySession>,
        sample_limit: usize,
        resolved_params: &[f64],
    ) -> Result<(RangeVectorStream, ResultSchema)>;
}

/// A scalar parameter of a transformer
#[derive(Clone)]
pub enum FuncArg {
    /// A literal scalar
    Static(f64),
    /// A nested plan reducing to one scalar; dispatched through the plan's
    /// own dispatcher
    Plan(Arc<dyn ExecPlan>),
}

/// Resolve transformer parameters. An empty sub-plan result resolves to
/// NaN; a failed sub-plan fails the query.
pub async fn resolve_func_args(
    args: &[FuncArg],
    session: &Arc<QuerySession>,
) -> Result<Vec<f64>> {
    let mut resolved = Vec::with_capacity(args.len());
    for arg in args {
        let value = match arg {
            FuncArg::Static(v) => *v,
            FuncArg::Plan(plan) => {
                let response = plan
                    .dispatcher()
                    .dispatch(Arc::clone(plan), Arc::clone(session))
                    .await;
                match response {
                    QueryResponse::Result(result) => {
                        let scalar = result
                            .result
                            .first()
                            .and_then(|rv| rv.decode_rows().first().map(|r| r.get_double(1)))
                            .unwrap_or(f64::NAN);
                        debug!(
                            query_id = %result.query_id,
                            scalar,
                            "resolved function argument sub-plan"
                        );
                        scalar
                    }
                    QueryResponse::Error(e) => return Err(e.error),
                }
            }
        };
        resolved.push(value);
    }
    Ok(resolved)
}

/// Map+reduce phases of a grouped aggregation
pub struct AggregateMapReduce {
    op: AggregateOperator,
    grouping: AggregationGrouping,
    skip_map_phase: bool,
    func_args: Vec<FuncArg>,
    parallelism: usize,
    output_range: Option<RvRange>,
}

impl AggregateMapReduce {
    /// Create the map+reduce stage for `op` grouped by `grouping`
    pub fn new(op: AggregateOperator, grouping: AggregationGrouping) -> Self {
        Self {
            op,
            grouping,
            skip_map_phase: false,
            func_args: Vec::new(),
            parallelism: num_cpus::get(),
            output_range: None,
        }
    }

    /// Input rows are already intermediates; feed them straight to reduce.
    /// Set at composing nodes whose children ran the map phase on leaves.
    pub fn skipping_map_phase(mut self) -> Self {
        self.skip_map_phase = true;
        self
    }

    /// Attach scalar parameters (static or sub-plan)
    pub fn with_func_args(mut self, args: Vec<FuncArg>) -> Self {
        self.func_args = args;
        self
    }

    /// Bound the parallel map phase
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Grid carried on the output vectors
    pub fn with_output_range(mut self, range: RvRange) -> Self {
        self.output_range = Some(range);
        self
    }

    fn resolved_op(&self, params: &[f64]) -> Result<AggregateOperator> {
        let op = match params.first() {
            Some(p) => self.op.with_scalar_param(*p)?,
            None => self.op.clone(),
        };
        op.validate()?;
        Ok(op)
    }
}

impl RangeVectorTransformer for AggregateMapReduce {
    fn name(&self) -> &'static str {
        "AggregateMapReduce"
    }

    fn args(&self) -> String {
        format!(
            "aggrOp={}{} skipMap={}",
            self.op.display(),
            self.grouping.display(),
            self.skip_map_phase
        )
    }

    fn func_args(&self) -> &[FuncArg] {
        &self.func_args
    }

    fn apply(
        &self,
        input: RangeVectorStream,
        input_schema: &ResultSchema,
        _session: Arc<QuerySession>,
        _sample_limit: usize,
        resolved_params: &[f64],
    ) -> Result<(RangeVectorStream, ResultSchema)> {
        let op = self.resolved_op(resolved_params)?;
        let schema = op.reduction_schema(input_schema);
        let stream = RangeVectorAggregator::map_reduce(
            op,
            self.skip_map_phase,
            input,
            self.grouping.clone(),
            self.parallelism,
            self.output_range,
        );
        Ok((stream, schema))
    }
}

/// Present phase of a grouped aggregation
pub struct AggregatePresent {
    op: AggregateOperator,
    func_args: Vec<FuncArg>,
    output_range: Option<RvRange>,
}

impl AggregatePresent {
    /// Create the present stage for `op`
    pub fn new(op: AggregateOperator) -> Self {
        Self {
            op,
            func_args: Vec::new(),
            output_range: None,
        }
    }

    /// Attach scalar parameters (static or sub-plan)
    pub fn with_func_args(mut self, args: Vec<FuncArg>) -> Self {
        self.func_args = args;
        self
    }

    /// Grid used to fill non-selected timestamps of fan-out operators
    pub fn with_output_range(mut self, range: RvRange) -> Self {
        self.output_range = Some(range);
        self
    }
}

impl RangeVectorTransformer for AggregatePresent {
    fn name(&self) -> &'static str {
        "AggregatePresent"
    }

    fn args(&self) -> String {
        format!("aggrOp={}", self.op.display())
    }

    fn func_args(&self) -> &[FuncArg] {
        &self.func_args
    }

    fn apply(
        &self,
        input: RangeVectorStream,
        input_schema: &ResultSchema,
        _session: Arc<QuerySession>,
        sample_limit: usize,
        resolved_params: &[f64],
    ) -> Result<(RangeVectorStream, ResultSchema)> {
        let op = match resolved_params.first() {
            Some(p) => self.op.with_scalar_param(*p)?,
            None => self.op.clone(),
        };
        op.validate()?;
        let schema = op.presentation_schema(input_schema);
        let stream =
            RangeVectorAggregator::present(op, input, sample_limit, self.output_range);
        Ok((stream, schema))
    }
}
