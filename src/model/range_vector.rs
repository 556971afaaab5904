//! Range vectors and range-vector streams
//!
//! A range vector is one labeled series as a sequence of rows inside a
//! query window. All range vectors of one result share a step grid; rows
//! are emitted in ascending timestamp order and absent samples are NaN
//! rows, never omissions.
//!
//! Streams of range vectors are lazy boxed futures streams so that
//! downstream materialization drains upstream work on demand.

use crate::error::{QueryError, Result};
use crate::model::key::RangeVectorKey;
use crate::model::row::Row;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

/// The output step grid of a query: inclusive start/end with a fixed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RvRange {
    /// First grid timestamp (milliseconds)
    pub start_ms: i64,
    /// Grid step (milliseconds, >= 1)
    pub step_ms: i64,
    /// Last grid timestamp (milliseconds, >= start)
    pub end_ms: i64,
}

impl RvRange {
    /// Create a grid, validating step and bounds
    pub fn new(start_ms: i64, step_ms: i64, end_ms: i64) -> Result<Self> {
        if step_ms < 1 {
            return Err(QueryError::bad_query(format!(
                "grid step must be >= 1 ms, got {step_ms}"
            )));
        }
        if end_ms < start_ms {
            return Err(QueryError::bad_query(format!(
                "grid end {end_ms} precedes start {start_ms}"
            )));
        }
        Ok(Self {
            start_ms,
            step_ms,
            end_ms,
        })
    }

    /// Number of grid timestamps, both ends inclusive
    pub fn num_steps(&self) -> usize {
        ((self.end_ms - self.start_ms) / self.step_ms) as usize + 1
    }

    /// Iterate the grid timestamps in ascending order
    pub fn timestamps(&self) -> impl Iterator<Item = i64> {
        let (start, step, end) = (self.start_ms, self.step_ms, self.end_ms);
        (0..).map(move |i| start + i * step).take_while(move |t| *t <= end)
    }
}

/// One labeled series of rows within a query window
pub trait RangeVector: Send {
    /// The label set identifying this series
    fn key(&self) -> &RangeVectorKey;

    /// The output grid, when known
    fn output_range(&self) -> Option<RvRange>;

    /// Row cursor in ascending timestamp order. Materialized vectors are
    /// restartable; cursors over storage may be single-shot and must only
    /// be consumed once.
    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_>;
}

/// A lazy stream of range vectors; errors terminate the stream
pub type RangeVectorStream = BoxStream<'static, Result<Box<dyn RangeVector>>>;

/// A stream with no range vectors
pub fn empty_stream() -> RangeVectorStream {
    stream::empty().boxed()
}

/// Wrap already-materialized vectors into a stream
pub fn stream_from_vectors(vectors: Vec<Box<dyn RangeVector>>) -> RangeVectorStream {
    stream::iter(vectors.into_iter().map(Ok)).boxed()
}

/// In-memory range vector with a restartable cursor
#[derive(Debug, Clone)]
pub struct MaterializedRangeVector {
    key: RangeVectorKey,
    rows: Vec<Row>,
    output_range: Option<RvRange>,
}

impl MaterializedRangeVector {
    /// Create from pre-built rows (ascending by timestamp)
    pub fn new(key: RangeVectorKey, rows: Vec<Row>, output_range: Option<RvRange>) -> Self {
        debug_assert!(rows.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
        Self {
            key,
            rows,
            output_range,
        }
    }

    /// Create from `(timestamp, value)` samples
    pub fn from_samples(
        key: RangeVectorKey,
        samples: &[(i64, f64)],
        output_range: Option<RvRange>,
    ) -> Self {
        let rows = samples.iter().map(|&(t, v)| Row::sample(t, v)).collect();
        Self::new(key, rows, output_range)
    }

    /// Number of rows
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Borrow the rows
    pub fn row_slice(&self) -> &[Row] {
        &self.rows
    }
}

impl RangeVector for MaterializedRangeVector {
    fn key(&self) -> &RangeVectorKey {
        &self.key
    }

    fn output_range(&self) -> Option<RvRange> {
        self.output_range
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(self.rows.iter().cloned())
    }
}

/// A scalar parameter materialized as a range vector: the same value at
/// every grid timestamp. Used for function arguments resolved from nested
/// plans; an empty nested result becomes `ScalarFixedDouble::nan`.
#[derive(Debug, Clone)]
pub struct ScalarFixedDouble {
    key: RangeVectorKey,
    value: f64,
    range: RvRange,
}

impl ScalarFixedDouble {
    /// Create a fixed scalar over the given grid
    pub fn new(value: f64, range: RvRange) -> Self {
        Self {
            key: RangeVectorKey::empty(),
            value,
            range,
        }
    }

    /// The NaN scalar, the value of an empty parameter sub-plan result
    pub fn nan(range: RvRange) -> Self {
        Self::new(f64::NAN, range)
    }

    /// The scalar value
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl RangeVector for ScalarFixedDouble {
    fn key(&self) -> &RangeVectorKey {
        &self.key
    }

    fn output_range(&self) -> Option<RvRange> {
        Some(self.range)
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        let value = self.value;
        Box::new(self.range.timestamps().map(move |t| Row::sample(t, value)))
    }
}

/// A scalar parameter that takes a different value at each grid timestamp,
/// materialized as a range vector. Produced when a parameter sub-plan
/// evaluates per step instead of to one constant; grid timestamps the
/// sub-plan left uncovered read as NaN.
#[derive(Debug, Clone)]
pub struct ScalarVaryingDouble {
    key: RangeVectorKey,
    values: Vec<(i64, f64)>,
    range: RvRange,
}

impl ScalarVaryingDouble {
    /// Create a varying scalar over the given grid. `values` must ascend
    /// by timestamp.
    pub fn new(values: Vec<(i64, f64)>, range: RvRange) -> Self {
        debug_assert!(values.windows(2).all(|w| w[0].0 < w[1].0));
        Self {
            key: RangeVectorKey::empty(),
            values,
            range,
        }
    }

    /// The scalar at `timestamp`, NaN when the sub-plan produced no value
    /// there
    pub fn value_at(&self, timestamp: i64) -> f64 {
        self.values
            .binary_search_by_key(&timestamp, |(t, _)| *t)
            .map(|i| self.values[i].1)
            .unwrap_or(f64::NAN)
    }
}

impl RangeVector for ScalarVaryingDouble {
    fn key(&self) -> &RangeVectorKey {
        &self.key
    }

    fn output_range(&self) -> Option<RvRange> {
        Some(self.range)
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(
            self.range
                .timestamps()
                .map(move |t| Row::sample(t, self.value_at(t))),
        )
    }
}
