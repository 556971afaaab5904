//! Streaming two-phase grouped aggregation over range-vector streams
//!
//! `map_reduce` drains a lazy stream of range vectors once, accumulating
//! per `(group key, timestamp)` cells, and emits one range vector per group
//! when the source completes. The map phase may run as parallel unordered
//! tasks bounded by the caller; reduction into the shared accumulator map
//! is serialized behind a mutex, so accumulation is free of data races and
//! insertion order is irrelevant to the result.

use crate::aggr::{AggAccumulator, AggregateOperator};
use crate::error::{QueryError, Result};
use crate::model::{
    MaterializedRangeVector, RangeVector, RangeVectorKey, RangeVectorStream, Row, RvRange,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future;
use std::sync::Arc;

/// How input series are partitioned into output groups
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationGrouping {
    /// Everything collapses into one group with the empty key
    All,
    /// Group by the listed label names (`by (...)`)
    By(Vec<String>),
    /// Group by everything except the listed label names (`without (...)`)
    Without(Vec<String>),
}

impl AggregationGrouping {
    /// The group key an input series with `key` lands in
    pub fn group_key(&self, key: &RangeVectorKey) -> RangeVectorKey {
        match self {
            AggregationGrouping::All => RangeVectorKey::empty(),
            AggregationGrouping::By(names) => key.project(names),
            AggregationGrouping::Without(names) => key.without(names),
        }
    }

    /// Clause rendering for plan args
    pub fn display(&self) -> String {
        match self {
            AggregationGrouping::All => String::new(),
            AggregationGrouping::By(names) => format!(" by ({})", names.join(",")),
            AggregationGrouping::Without(names) => format!(" without ({})", names.join(",")),
        }
    }
}

type GroupMap = BTreeMap<RangeVectorKey, BTreeMap<i64, AggAccumulator>>;

/// The streaming two-phase aggregation engine
pub struct RangeVectorAggregator;

impl RangeVectorAggregator {
    /// Grouped map/reduce over a stream of range vectors.
    ///
    /// With `skip_map_phase` the source rows are already intermediates
    /// (the output of a downstream shard's reduce) and feed the
    /// accumulators directly. Output vectors carry `output_range` and
    /// their rows ascend by timestamp; an empty source yields an empty
    /// stream.
    pub fn map_reduce(
        op: AggregateOperator,
        skip_map_phase: bool,
        source: RangeVectorStream,
        grouping: AggregationGrouping,
        parallelism: usize,
        output_range: Option<RvRange>,
    ) -> RangeVectorStream {
        let op = Arc::new(op);
        let fut = async move {
            let groups: Arc<Mutex<GroupMap>> = Arc::new(Mutex::new(BTreeMap::new()));

            async fn map_one(
                rv: Box<dyn RangeVector + 'static>,
                op: Arc<AggregateOperator>,
                groups: Arc<Mutex<GroupMap>>,
                grouping: AggregationGrouping,
                skip_map_phase: bool,
            ) -> Result<()> {
                let group_key = grouping.group_key(rv.key());
                let mut intermediates = Vec::new();
                for row in rv.rows() {
                    let irow = if skip_map_phase {
                        row
                    } else {
                        op.map(rv.key(), &row)?
                    };
                    intermediates.push(irow);
                }
                let mut guard = groups.lock();
                let cells = guard.entry(group_key).or_default();
                for irow in intermediates {
                    let ts = irow.timestamp();
                    let acc = cells
                        .entry(ts)
                        .or_insert_with(|| op.new_accumulator_for(&irow));
                    acc.reduce(&irow)?;
                }
                Ok(())
            }

            let mut source = source;
            let max_in_flight = parallelism.max(1);
            let mut in_flight = stream::FuturesUnordered::new();
            let mut source_done = false;
            while !source_done || !in_flight.is_empty() {
                while !source_done && in_flight.len() < max_in_flight {
                    match source.next().await {
                        Some(Ok(rv)) => {
                            in_flight.push(map_one(
                                rv,
                                Arc::clone(&op),
                                Arc::clone(&groups),
                                grouping.clone(),
                                skip_map_phase,
                            ));
                        }
                        Some(Err(e)) => return Err(e),
                        None => source_done = true,
                    }
                }
                if let Some(result) = in_flight.next().await {
                    result?;
                }
            }

            let groups = std::mem::take(&mut *groups.lock());
            let mut out: Vec<Box<dyn RangeVector>> = Vec::with_capacity(groups.len());
            for (group_key, cells) in groups {
                let rows: Vec<Row> = cells.iter().map(|(ts, acc)| acc.to_row(*ts)).collect();
                out.push(Box::new(MaterializedRangeVector::new(
                    group_key,
                    rows,
                    output_range,
                )));
            }
            Ok(out)
        };
        flatten_vectors(fut)
    }

    /// Translate reduced groups into user-visible range vectors via the
    /// operator's present phase. Fan-out operators re-key into multiple
    /// output vectors spanning the output grid, NaN-filled where a series
    /// was not selected.
    pub fn present(
        op: AggregateOperator,
        source: RangeVectorStream,
        limit: usize,
        output_range: Option<RvRange>,
    ) -> RangeVectorStream {
        source
            .map(move |rv_res| match rv_res {
                Ok(rv) => match op.present(rv.as_ref(), output_range, limit) {
                    Ok(outs) => stream::iter(
                        outs.into_iter()
                            .map(|m| Ok(Box::new(m) as Box<dyn RangeVector>)),
                    )
                    .boxed(),
                    Err(e) => stream::once(future::ready(Err(e))).boxed(),
                },
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .flatten()
            .boxed()
    }
}

/// Turn a future of materialized vectors into a lazy stream of them
fn flatten_vectors(
    fut: impl std::future::Future<Output = Result<Vec<Box<dyn RangeVector>>>> + Send + 'static,
) -> RangeVectorStream {
    stream::once(fut)
        .map(|res| match res {
            Ok(vectors) => stream::iter(vectors.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(future::ready(Err::<Box<dyn RangeVector>, QueryError>(e)))
                .boxed(),
        })
        .flatten()
        .boxed()
}
