//! Leaf plans: raw row streams out of a series source
//!
//! Storage is an external collaborator behind the `SeriesSource` trait;
//! only its row-producing surface matters to the engine. The in-memory
//! source ships for tests and embedding.

use crate::error::Result;
use crate::exec::dispatcher::PlanDispatcher;
use crate::exec::plan::{ExecPlan, ExecResult, QueryContext, QuerySession};
use crate::exec::transformer::RangeVectorTransformer;
use crate::model::{
    stream_from_vectors, MaterializedRangeVector, RangeVector, ResultSchema, RvRange,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Produces the raw series rows a leaf plan scans
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Layout of the rows this source produces
    fn result_schema(&self) -> ResultSchema;

    /// Scan all matching series in `dataset` within `range`
    async fn scan(
        &self,
        dataset: &str,
        range: Option<RvRange>,
    ) -> Result<Vec<MaterializedRangeVector>>;
}

/// A source backed by pre-built series, for tests and embedding
pub struct InMemorySeriesSource {
    schema: ResultSchema,
    series: Vec<MaterializedRangeVector>,
}

impl InMemorySeriesSource {
    /// Create a source over the given series
    pub fn new(schema: ResultSchema, series: Vec<MaterializedRangeVector>) -> Arc<Self> {
        Arc::new(Self { schema, series })
    }

    /// Source over `(timestamp, value)` series
    pub fn of_samples(series: Vec<MaterializedRangeVector>) -> Arc<Self> {
        Self::new(ResultSchema::sample_schema(), series)
    }
}

#[async_trait]
impl SeriesSource for InMemorySeriesSource {
    fn result_schema(&self) -> ResultSchema {
        self.schema.clone()
    }

    async fn scan(
        &self,
        _dataset: &str,
        _range: Option<RvRange>,
    ) -> Result<Vec<MaterializedRangeVector>> {
        Ok(self.series.clone())
    }
}

/// Leaf plan scanning one series source
pub struct SeriesScanExec {
    context: QueryContext,
    dataset: String,
    dispatcher: Arc<dyn PlanDispatcher>,
    source: Arc<dyn SeriesSource>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
    range: Option<RvRange>,
}

impl SeriesScanExec {
    /// Create a scan over `source`
    pub fn new(
        context: QueryContext,
        dataset: impl Into<String>,
        dispatcher: Arc<dyn PlanDispatcher>,
        source: Arc<dyn SeriesSource>,
    ) -> Self {
        Self {
            context,
            dataset: dataset.into(),
            dispatcher,
            source,
            transformers: Vec::new(),
            range: None,
        }
    }

    /// Restrict the scan to a grid window
    pub fn with_range(mut self, range: RvRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Append a transformer to this node's chain
    pub fn with_transformer(mut self, transformer: Arc<dyn RangeVectorTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }
}

#[async_trait]
impl ExecPlan for SeriesScanExec {
    fn name(&self) -> &'static str {
        "SeriesScanExec"
    }

    fn args(&self) -> String {
        match self.range {
            Some(r) => format!(
                "dataset={} start={} step={} end={}",
                self.dataset, r.start_ms, r.step_ms, r.end_ms
            ),
            None => format!("dataset={}", self.dataset),
        }
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

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(&self, session: Arc<QuerySession>) -> Result<ExecResult> {
        let series = self.source.scan(&self.dataset, self.range).await?;
        if series.is_empty() {
            return Ok(ExecResult::empty());
        }
        let rows_scanned: usize = series.iter().map(|s| s.num_rows()).sum();
        session.stats.add_rows_scanned(rows_scanned as u64);
        debug!(
            query_id = %self.context.query_id,
            dataset = %self.dataset,
            series = series.len(),
            rows = rows_scanned,
            "scanned series source"
        );
        let vectors: Vec<Box<dyn RangeVector>> = series
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn RangeVector>)
            .collect();
        Ok(ExecResult::new(
            self.source.result_schema(),
            stream_from_vectors(vectors),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::dispatcher::InProcessDispatcher;
    use crate::model::RangeVectorKey;

    #[tokio::test]
    async fn test_scan_produces_source_schema_and_rows() {
        let source = InMemorySeriesSource::of_samples(vec![
            MaterializedRangeVector::from_samples(
                RangeVectorKey::from_pairs([("i", "a")]),
                &[(1000, 1.0), (2000, 2.0)],
                None,
            ),
        ]);
        let plan = SeriesScanExec::new(
            QueryContext::new("q"),
            "telemetry",
            InProcessDispatcher::shared(),
            source,
        );
        let session = QuerySession::new();
        let result = plan.do_execute(Arc::clone(&session)).await.unwrap();
        assert_eq!(result.schema, ResultSchema::sample_schema());
        assert_eq!(session.stats.snapshot().rows_scanned, 2);
    }

    #[tokio::test]
    async fn test_empty_source_yields_empty_schema() {
        let source = InMemorySeriesSource::of_samples(vec![]);
        let plan = SeriesScanExec::new(
            QueryContext::new("q"),
            "telemetry",
            InProcessDispatcher::shared(),
            source,
        );
        let result = plan.do_execute(QuerySession::new()).await.unwrap();
        assert!(result.schema.is_empty());
    }
}
