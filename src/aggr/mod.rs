//! Row aggregators - the grouped aggregation algebra
//!
//! Every aggregation operator is expressed as three row-level phases over a
//! small typed accumulator:
//! - `map`: leaf-side per-row projection into an intermediate row
//! - `reduce`: combination of intermediate rows at the same timestamp
//! - `present`: translation of reduced intermediates into the user-visible
//!   rows, possibly fanning one group out into several series
//!
//! Intermediates travel as ordinary rows whose column count depends on the
//! operator; [`AggregateOperator::reduction_schema`] tells downstream
//! consumers the layout. All phases are NaN-aware: a NaN input at a
//! timestamp is skipped unless every input at that timestamp is NaN, in
//! which case the aggregate is NaN.

pub mod accumulator;
pub mod count_values;
pub mod map_reduce;
pub mod topk;

pub use accumulator::{AggAccumulator, StatKind, DIGEST_COMPRESSION};
pub use map_reduce::{AggregationGrouping, RangeVectorAggregator};

use crate::error::{QueryError, Result};
use crate::model::{
    ColumnInfo, ColumnType, MaterializedRangeVector, RangeVector, RangeVectorKey, ResultSchema,
    Row, RowReader, RowValue, RvRange,
};
use tdigest::TDigest;

/// An aggregation operator with its parameters
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOperator {
    /// NaN-skipping sum; also sums histograms bucket-wise
    Sum,
    /// Weighted mean
    Avg,
    /// Count of non-NaN inputs (NaN when all inputs are NaN)
    Count,
    /// NaN-skipping minimum
    Min,
    /// NaN-skipping maximum
    Max,
    /// Population standard deviation
    Stddev,
    /// Population variance
    Stdvar,
    /// 1.0 wherever any input is non-NaN
    Group,
    /// The k largest series per timestamp
    TopK(usize),
    /// The k smallest series per timestamp
    BottomK(usize),
    /// Streaming quantile, q in [0, 1]
    Quantile(f64),
    /// Occurrence count per distinct value, fanned out under the given label
    CountValues(String),
}

impl AggregateOperator {
    /// Operator name as it appears in plan args
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOperator::Sum => "sum",
            AggregateOperator::Avg => "avg",
            AggregateOperator::Count => "count",
            AggregateOperator::Min => "min",
            AggregateOperator::Max => "max",
            AggregateOperator::Stddev => "stddev",
            AggregateOperator::Stdvar => "stdvar",
            AggregateOperator::Group => "group",
            AggregateOperator::TopK(_) => "topk",
            AggregateOperator::BottomK(_) => "bottomk",
            AggregateOperator::Quantile(_) => "quantile",
            AggregateOperator::CountValues(_) => "count_values",
        }
    }

    /// Operator with parameters, for plan-tree display
    pub fn display(&self) -> String {
        match self {
            AggregateOperator::TopK(k) | AggregateOperator::BottomK(k) => {
                format!("{}({k})", self.name())
            }
            AggregateOperator::Quantile(q) => format!("quantile({q})"),
            AggregateOperator::CountValues(label) => format!("count_values({label:?})"),
            _ => self.name().to_string(),
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        match self {
            AggregateOperator::TopK(k) | AggregateOperator::BottomK(k) if *k < 1 => Err(
                QueryError::bad_query(format!("{} needs k >= 1, got {k}", self.name())),
            ),
            AggregateOperator::Quantile(q) if !(0.0..=1.0).contains(q) => Err(
                QueryError::bad_query(format!("quantile must be in [0, 1], got {q}")),
            ),
            AggregateOperator::CountValues(label) if label.is_empty() => {
                Err(QueryError::bad_query("count_values needs a label name"))
            }
            _ => Ok(()),
        }
    }

    /// Rebuild the operator with a scalar parameter resolved from a
    /// function argument. Operators without a scalar parameter are
    /// unchanged.
    pub fn with_scalar_param(&self, param: f64) -> Result<AggregateOperator> {
        let op = match self {
            AggregateOperator::TopK(_) | AggregateOperator::BottomK(_) => {
                if !param.is_finite() || param < 1.0 {
                    return Err(QueryError::bad_query(format!(
                        "{} needs k >= 1, got {param}",
                        self.name()
                    )));
                }
                match self {
                    AggregateOperator::TopK(_) => AggregateOperator::TopK(param as usize),
                    _ => AggregateOperator::BottomK(param as usize),
                }
            }
            AggregateOperator::Quantile(_) => AggregateOperator::Quantile(param),
            other => other.clone(),
        };
        op.validate()?;
        Ok(op)
    }

    /// Leaf-side projection of one raw sample row into an intermediate row
    pub fn map(&self, key: &RangeVectorKey, row: &Row) -> Result<Row> {
        let ts = row.timestamp();
        match self {
            AggregateOperator::Sum => Ok(row.clone()),
            AggregateOperator::Min | AggregateOperator::Max => {
                Ok(Row::sample(ts, self.double_input(row)?))
            }
            AggregateOperator::Count | AggregateOperator::Group => {
                let v = self.double_input(row)?;
                Ok(Row::sample(ts, if v.is_nan() { f64::NAN } else { 1.0 }))
            }
            AggregateOperator::Avg => {
                let v = self.double_input(row)?;
                let count = if v.is_nan() { 0.0 } else { 1.0 };
                Ok(Row::new(vec![
                    RowValue::Long(ts),
                    RowValue::Double(v),
                    RowValue::Double(count),
                ]))
            }
            AggregateOperator::Stddev | AggregateOperator::Stdvar => {
                let v = self.double_input(row)?;
                let count = if v.is_nan() { 0.0 } else { 1.0 };
                Ok(Row::new(vec![
                    RowValue::Long(ts),
                    RowValue::Double(0.0),
                    RowValue::Double(v),
                    RowValue::Double(count),
                ]))
            }
            AggregateOperator::TopK(k) => {
                Ok(topk::map_row(*k, false, key, ts, self.double_input(row)?))
            }
            AggregateOperator::BottomK(k) => {
                Ok(topk::map_row(*k, true, key, ts, self.double_input(row)?))
            }
            AggregateOperator::Quantile(_) => {
                let blob = accumulator::single_value_digest_blob(self.double_input(row)?);
                Ok(Row::new(vec![RowValue::Long(ts), RowValue::Str(blob)]))
            }
            AggregateOperator::CountValues(_) => {
                Ok(Row::sample(ts, self.double_input(row)?))
            }
        }
    }

    fn double_input(&self, row: &Row) -> Result<f64> {
        match row.cell(1) {
            RowValue::Double(v) => Ok(*v),
            other => Err(QueryError::bad_query(format!(
                "{} does not aggregate {other:?} columns",
                self.name()
            ))),
        }
    }

    /// Layout of the intermediate rows produced by `map` and `reduce`
    pub fn reduction_schema(&self, source: &ResultSchema) -> ResultSchema {
        let fixed_vector_len = source.fixed_vector_len;
        let ts = ColumnInfo::new("timestamp", ColumnType::Timestamp);
        match self {
            AggregateOperator::Sum => source.clone(),
            AggregateOperator::Min
            | AggregateOperator::Max
            | AggregateOperator::Count
            | AggregateOperator::Group => ResultSchema::new(
                vec![ts, ColumnInfo::new("value", ColumnType::Double)],
                fixed_vector_len,
            ),
            AggregateOperator::Avg => ResultSchema::new(
                vec![
                    ts,
                    ColumnInfo::new("mean", ColumnType::Double),
                    ColumnInfo::new("count", ColumnType::Double),
                ],
                fixed_vector_len,
            ),
            AggregateOperator::Stddev | AggregateOperator::Stdvar => ResultSchema::new(
                vec![
                    ts,
                    ColumnInfo::new(self.name(), ColumnType::Double),
                    ColumnInfo::new("mean", ColumnType::Double),
                    ColumnInfo::new("count", ColumnType::Double),
                ],
                fixed_vector_len,
            ),
            AggregateOperator::TopK(k) | AggregateOperator::BottomK(k) => {
                let mut columns = Vec::with_capacity(2 * k + 1);
                columns.push(ts);
                for slot in 0..*k {
                    columns.push(ColumnInfo::new(format!("value{slot}"), ColumnType::Double));
                    columns.push(ColumnInfo::new(format!("series{slot}"), ColumnType::String));
                }
                ResultSchema::new(columns, fixed_vector_len)
            }
            AggregateOperator::Quantile(_) => ResultSchema::new(
                vec![ts, ColumnInfo::new("digest", ColumnType::String)],
                fixed_vector_len,
            ),
            AggregateOperator::CountValues(_) => ResultSchema::new(
                vec![ts, ColumnInfo::new("counts", ColumnType::String)],
                fixed_vector_len,
            ),
        }
    }

    /// Layout of the rows produced by `present`
    pub fn presentation_schema(&self, reduction: &ResultSchema) -> ResultSchema {
        if matches!(self, AggregateOperator::Sum) && reduction.is_histogram_value() {
            let mut schema = ResultSchema::histogram_schema();
            schema.fixed_vector_len = reduction.fixed_vector_len;
            return schema;
        }
        let mut schema = ResultSchema::sample_schema();
        schema.fixed_vector_len = reduction.fixed_vector_len;
        schema
    }

    /// Fresh accumulator for one group/timestamp cell. The first
    /// intermediate row decides between the numeric and histogram forms of
    /// sum.
    pub fn new_accumulator_for(&self, first_row: &Row) -> AggAccumulator {
        match self {
            AggregateOperator::Sum => match first_row.cell(1) {
                RowValue::Histogram(_) => AggAccumulator::SumHist { value: None },
                _ => AggAccumulator::Sum { value: f64::NAN },
            },
            AggregateOperator::Count => AggAccumulator::Sum { value: f64::NAN },
            AggregateOperator::Min => AggAccumulator::Min { value: f64::NAN },
            AggregateOperator::Max => AggAccumulator::Max { value: f64::NAN },
            AggregateOperator::Group => AggAccumulator::Group { value: f64::NAN },
            AggregateOperator::Avg => AggAccumulator::Avg {
                mean: 0.0,
                count: 0.0,
            },
            AggregateOperator::Stddev => AggAccumulator::Stat {
                kind: StatKind::Stddev,
                mean: 0.0,
                m2: 0.0,
                count: 0.0,
            },
            AggregateOperator::Stdvar => AggAccumulator::Stat {
                kind: StatKind::Stdvar,
                mean: 0.0,
                m2: 0.0,
                count: 0.0,
            },
            AggregateOperator::TopK(k) => {
                AggAccumulator::TopK(topk::TopKAccumulator::new(*k, false))
            }
            AggregateOperator::BottomK(k) => {
                AggAccumulator::TopK(topk::TopKAccumulator::new(*k, true))
            }
            AggregateOperator::Quantile(_) => AggAccumulator::Digest { digest: None },
            AggregateOperator::CountValues(_) => {
                AggAccumulator::CountValues(count_values::CountValuesAccumulator::new())
            }
        }
    }

    /// Translate one reduced group into user-visible range vectors.
    ///
    /// Single-output operators keep the group key; fan-out operators
    /// (top-k, bottom-k, count_values) re-key and fill non-selected grid
    /// timestamps with NaN. `limit` bounds the fan-out.
    pub fn present(
        &self,
        rv: &dyn RangeVector,
        range: Option<RvRange>,
        limit: usize,
    ) -> Result<Vec<MaterializedRangeVector>> {
        let range = range.or_else(|| rv.output_range());
        match self {
            AggregateOperator::Sum
            | AggregateOperator::Min
            | AggregateOperator::Max
            | AggregateOperator::Count
            | AggregateOperator::Group => Ok(vec![MaterializedRangeVector::new(
                rv.key().clone(),
                rv.rows().collect(),
                range,
            )]),
            AggregateOperator::Avg | AggregateOperator::Stddev | AggregateOperator::Stdvar => {
                let rows = rv
                    .rows()
                    .map(|row| Row::sample(row.timestamp(), row.get_double(1)))
                    .collect();
                Ok(vec![MaterializedRangeVector::new(
                    rv.key().clone(),
                    rows,
                    range,
                )])
            }
            AggregateOperator::TopK(k) => topk::present(rv, *k, false, range, limit),
            AggregateOperator::BottomK(k) => topk::present(rv, *k, true, range, limit),
            AggregateOperator::Quantile(q) => {
                let rows = rv
                    .rows()
                    .map(|row| {
                        let digest: TDigest =
                            serde_json::from_str(row.get_str(1)).map_err(|e| {
                                QueryError::internal(format!(
                                    "undecodable digest intermediate: {e}"
                                ))
                            })?;
                        let value = if digest.is_empty() {
                            f64::NAN
                        } else {
                            digest.estimate_quantile(*q)
                        };
                        Ok(Row::sample(row.timestamp(), value))
                    })
                    .collect::<Result<Vec<Row>>>()?;
                Ok(vec![MaterializedRangeVector::new(
                    rv.key().clone(),
                    rows,
                    range,
                )])
            }
            AggregateOperator::CountValues(label) => {
                count_values::present(rv, label, range, limit)
            }
        }
    }
}
