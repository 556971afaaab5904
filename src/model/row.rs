//! Sample rows and positional readers
//!
//! A row is a tuple of typed cells whose first cell is always a millisecond
//! timestamp. Aggregator intermediates reuse the same shape with
//! operator-specific layouts (pairs of doubles and strings for top-k,
//! serialized digests for quantile, and so on), so the cell type is a small
//! variant rather than a fixed (timestamp, value) pair.

use crate::model::histogram::HistogramValue;
use serde::{Deserialize, Serialize};

/// One typed cell of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowValue {
    /// 64-bit integer (column 0 is always a millisecond timestamp)
    Long(i64),
    /// 64-bit float sample or statistic
    Double(f64),
    /// UTF-8 string (carried keys, serialized digests)
    Str(String),
    /// Schema-tagged histogram sample
    Histogram(HistogramValue),
}

/// Positional typed access into a row.
///
/// Reading a cell with the wrong accessor is a programming error and
/// panics, as positional readers do; column layouts are fixed per schema.
pub trait RowReader {
    /// Read column `col` as an integer
    fn get_long(&self, col: usize) -> i64;
    /// Read column `col` as a double
    fn get_double(&self, col: usize) -> f64;
    /// Read column `col` as a string
    fn get_str(&self, col: usize) -> &str;
    /// Read column `col` as a histogram
    fn get_histogram(&self, col: usize) -> &HistogramValue;
}

/// A materialized row of typed cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<RowValue>,
}

impl Row {
    /// Build a row from cells. The first cell must be the timestamp.
    pub fn new(cells: Vec<RowValue>) -> Self {
        debug_assert!(matches!(cells.first(), Some(RowValue::Long(_))));
        Self { cells }
    }

    /// The common case: a `(timestamp, double)` sample row
    pub fn sample(timestamp: i64, value: f64) -> Self {
        Self {
            cells: vec![RowValue::Long(timestamp), RowValue::Double(value)],
        }
    }

    /// A `(timestamp, histogram)` sample row
    pub fn histogram_sample(timestamp: i64, value: HistogramValue) -> Self {
        Self {
            cells: vec![RowValue::Long(timestamp), RowValue::Histogram(value)],
        }
    }

    /// The row timestamp (column 0)
    pub fn timestamp(&self) -> i64 {
        self.get_long(0)
    }

    /// Number of columns
    pub fn num_cols(&self) -> usize {
        self.cells.len()
    }

    /// Borrow a cell
    pub fn cell(&self, col: usize) -> &RowValue {
        &self.cells[col]
    }

    /// All cells in order
    pub fn cells(&self) -> &[RowValue] {
        &self.cells
    }
}

impl RowReader for Row {
    fn get_long(&self, col: usize) -> i64 {
        match &self.cells[col] {
            RowValue::Long(v) => *v,
            other => panic!("column {col} is not a Long: {other:?}"),
        }
    }

    fn get_double(&self, col: usize) -> f64 {
        match &self.cells[col] {
            RowValue::Double(v) => *v,
            other => panic!("column {col} is not a Double: {other:?}"),
        }
    }

    fn get_str(&self, col: usize) -> &str {
        match &self.cells[col] {
            RowValue::Str(v) => v.as_str(),
            other => panic!("column {col} is not a Str: {other:?}"),
        }
    }

    fn get_histogram(&self, col: usize) -> &HistogramValue {
        match &self.cells[col] {
            RowValue::Histogram(v) => v,
            other => panic!("column {col} is not a Histogram: {other:?}"),
        }
    }
}

/// Mutable single-shot `(timestamp, value)` row used as the map-phase
/// scratch cell; reset between rows rather than reallocated.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientRow {
    /// Millisecond timestamp
    pub timestamp: i64,
    /// Sample value
    pub value: f64,
}

impl TransientRow {
    /// Create a transient row
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Overwrite both cells
    pub fn set(&mut self, timestamp: i64, value: f64) {
        self.timestamp = timestamp;
        self.value = value;
    }

    /// Materialize into an owned row
    pub fn to_row(self) -> Row {
        Row::sample(self.timestamp, self.value)
    }
}

impl RowReader for TransientRow {
    fn get_long(&self, col: usize) -> i64 {
        match col {
            0 => self.timestamp,
            _ => panic!("column {col} is not a Long in a transient row"),
        }
    }

    fn get_double(&self, col: usize) -> f64 {
        match col {
            1 => self.value,
            _ => panic!("column {col} is not a Double in a transient row"),
        }
    }

    fn get_str(&self, col: usize) -> &str {
        panic!("column {col} is not a Str in a transient row")
    }

    fn get_histogram(&self, col: usize) -> &HistogramValue {
        panic!("column {col} is not a Histogram in a transient row")
    }
}
