//! count_values aggregation state
//!
//! Groups samples by exact value at each timestamp and counts occurrences.
//! The intermediate row carries the per-timestamp `(value, count)` pairs as
//! a serialized string cell; the present phase fans out one range vector
//! per distinct value, keyed by a caller-chosen label holding the formatted
//! value.

use crate::error::{QueryError, Result};
use crate::model::{
    MaterializedRangeVector, RangeVector, Row, RowReader, RowValue, RvRange,
};
use std::collections::HashMap;

/// Canonical float formatting for count_values label values: the shortest
/// representation that keeps a decimal point (`2.0`, `5.6`). Equal values
/// always format equally.
pub fn format_value(value: f64) -> String {
    format!("{value:?}")
}

/// Per-timestamp value histogram for one group
#[derive(Debug, Clone, Default)]
pub struct CountValuesAccumulator {
    /// Count per distinct value, keyed by the value's bit pattern
    counts: HashMap<u64, u64>,
}

impl CountValuesAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one intermediate row. Map-phase rows carry the raw double;
    /// reduce-phase rows carry a serialized pair list.
    pub fn reduce_row(&mut self, row: &Row) -> Result<()> {
        match row.cell(1) {
            RowValue::Double(v) => {
                if !v.is_nan() {
                    *self.counts.entry(v.to_bits()).or_insert(0) += 1;
                }
                Ok(())
            }
            RowValue::Str(blob) => {
                for (value, count) in decode_pairs(blob)? {
                    *self.counts.entry(value.to_bits()).or_insert(0) += count;
                }
                Ok(())
            }
            other => Err(QueryError::internal(format!(
                "count_values row carries {other:?}, expected Double or Str"
            ))),
        }
    }

    /// Emit the intermediate row for this timestamp
    pub fn to_row(&self, timestamp: i64) -> Row {
        let mut pairs: Vec<(f64, u64)> = self
            .counts
            .iter()
            .map(|(bits, count)| (f64::from_bits(*bits), *count))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        Row::new(vec![
            RowValue::Long(timestamp),
            RowValue::Str(encode_pairs(&pairs)),
        ])
    }

    /// Distinct values counted so far
    pub fn num_distinct(&self) -> usize {
        self.counts.len()
    }
}

fn encode_pairs(pairs: &[(f64, u64)]) -> String {
    serde_json::to_string(pairs).unwrap_or_default()
}

fn decode_pairs(blob: &str) -> Result<Vec<(f64, u64)>> {
    serde_json::from_str(blob)
        .map_err(|e| QueryError::internal(format!("undecodable count_values blob: {e}")))
}

/// Expand one reduced group into one range vector per distinct value. The
/// output key is the group key extended with `label = formatted(value)`;
/// timestamps where the value did not occur are NaN.
pub fn present(
    rv: &dyn RangeVector,
    label: &str,
    range: Option<RvRange>,
    limit: usize,
) -> Result<Vec<MaterializedRangeVector>> {
    let range = range.or_else(|| rv.output_range());

    // per distinct value: timestamp -> count
    let mut values: Vec<u64> = Vec::new();
    let mut counts: HashMap<u64, HashMap<i64, u64>> = HashMap::new();
    let mut observed_ts: Vec<i64> = Vec::new();

    for row in rv.rows() {
        let ts = row.timestamp();
        observed_ts.push(ts);
        for (value, count) in decode_pairs(row.get_str(1))? {
            let bits = value.to_bits();
            if !counts.contains_key(&bits) {
                values.push(bits);
            }
            counts.entry(bits).or_default().insert(ts, count);
        }
    }

    if values.len() > limit {
        return Err(QueryError::bad_query(format!(
            "count_values produced {} output series, limit is {limit}",
            values.len()
        )));
    }
    values.sort_by(|a, b| f64::from_bits(*a).total_cmp(&f64::from_bits(*b)));

    let grid: Vec<i64> = match range {
        Some(r) => r.timestamps().collect(),
        None => observed_ts,
    };

    let mut out = Vec::with_capacity(values.len());
    for bits in values {
        let value = f64::from_bits(bits);
        let key = rv.key().with_label(label, format_value(value));
        let per_ts = &counts[&bits];
        let rows = grid
            .iter()
            .map(|ts| {
                let count = per_ts.get(ts).map(|c| *c as f64).unwrap_or(f64::NAN);
                Row::sample(*ts, count)
            })
            .collect();
        out.push(MaterializedRangeVector::new(key, rows, range));
    }
    Ok(out)
}
