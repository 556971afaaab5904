//! Bounded top-k / bottom-k aggregation state
//!
//! The intermediate row of a k-selection has `2k + 1` columns: the
//! timestamp followed by k `(value, series)` pairs ordered best-first.
//! Unfilled slots hold a sentinel value (`-f64::MAX` for top-k,
//! `f64::MAX` for bottom-k) and an empty series string; sentinels never
//! leak past the present phase.

use crate::error::{QueryError, Result};
use crate::model::{
    MaterializedRangeVector, RangeVector, RangeVectorKey, Row, RowReader, RowValue, RvRange,
};
use std::collections::HashMap;

/// Accumulator for one group/timestamp of a top-k or bottom-k aggregation
#[derive(Debug, Clone)]
pub struct TopKAccumulator {
    k: usize,
    bottom: bool,
    /// Filled slots, best-first; never longer than k
    slots: Vec<(f64, String)>,
}

impl TopKAccumulator {
    /// Create an empty accumulator for `k` slots
    pub fn new(k: usize, bottom: bool) -> Self {
        Self {
            k,
            bottom,
            slots: Vec::with_capacity(k),
        }
    }

    /// The sentinel marking an unfilled slot
    pub fn sentinel(bottom: bool) -> f64 {
        if bottom {
            f64::MAX
        } else {
            -f64::MAX
        }
    }

    /// Offer a candidate. NaN values are never candidates, even when slots
    /// are unfilled. Equal values keep their offer order (stable merge).
    pub fn offer(&mut self, value: f64, series: &str) {
        if value.is_nan() || value == Self::sentinel(self.bottom) {
            return;
        }
        let pos = if self.bottom {
            self.slots.iter().position(|(v, _)| *v > value)
        } else {
            self.slots.iter().position(|(v, _)| *v < value)
        };
        match pos {
            Some(i) => self.slots.insert(i, (value, series.to_string())),
            None if self.slots.len() < self.k => self.slots.push((value, series.to_string())),
            None => return,
        }
        self.slots.truncate(self.k);
    }

    /// Merge one intermediate row into this accumulator
    pub fn reduce_row(&mut self, row: &Row) -> Result<()> {
        let expected = 2 * self.k + 1;
        if row.num_cols() != expected {
            return Err(QueryError::internal(format!(
                "k-selection row has {} columns, expected {expected}",
                row.num_cols()
            )));
        }
        for slot in 0..self.k {
            let value = row.get_double(2 * slot + 1);
            if value.is_nan() || value == Self::sentinel(self.bottom) {
                continue;
            }
            self.offer(value, row.get_str(2 * slot + 2));
        }
        Ok(())
    }

    /// Emit the intermediate row for this timestamp
    pub fn to_row(&self, timestamp: i64) -> Row {
        let mut cells = Vec::with_capacity(2 * self.k + 1);
        cells.push(RowValue::Long(timestamp));
        for slot in 0..self.k {
            match self.slots.get(slot) {
                Some((v, s)) => {
                    cells.push(RowValue::Double(*v));
                    cells.push(RowValue::Str(s.clone()));
                }
                None => {
                    cells.push(RowValue::Double(Self::sentinel(self.bottom)));
                    cells.push(RowValue::Str(String::new()));
                }
            }
        }
        Row::new(cells)
    }

    /// Filled slots, best-first
    pub fn slots(&self) -> &[(f64, String)] {
        &self.slots
    }
}

/// Build the map-phase intermediate row for one input sample: the input
/// series occupies the first slot unless its value is NaN.
pub fn map_row(k: usize, bottom: bool, key: &RangeVectorKey, timestamp: i64, value: f64) -> Row {
    let mut acc = TopKAccumulator::new(k, bottom);
    acc.offer(value, &key.to_carry_string());
    acc.to_row(timestamp)
}

/// Expand one reduced group into up to k output range vectors keyed by the
/// carried series keys. Timestamps where a series was not selected are NaN.
pub fn present(
    rv: &dyn RangeVector,
    k: usize,
    bottom: bool,
    range: Option<RvRange>,
    limit: usize,
) -> Result<Vec<MaterializedRangeVector>> {
    let sentinel = TopKAccumulator::sentinel(bottom);
    let range = range.or_else(|| rv.output_range());

    // selected values per carried series key, in first-selected order
    let mut order: Vec<String> = Vec::new();
    let mut selected: HashMap<String, HashMap<i64, f64>> = HashMap::new();
    let mut observed_ts: Vec<i64> = Vec::new();

    for row in rv.rows() {
        let ts = row.timestamp();
        observed_ts.push(ts);
        for slot in 0..k {
            let value = row.get_double(2 * slot + 1);
            if value.is_nan() || value == sentinel {
                continue;
            }
            let series = row.get_str(2 * slot + 2);
            if !selected.contains_key(series) {
                order.push(series.to_string());
            }
            selected
                .entry(series.to_string())
                .or_default()
                .insert(ts, value);
        }
    }

    if order.len() > limit {
        return Err(QueryError::bad_query(format!(
            "k-selection produced {} output series, limit is {limit}",
            order.len()
        )));
    }

    let grid: Vec<i64> = match range {
        Some(r) => r.timestamps().collect(),
        None => observed_ts,
    };

    let mut out = Vec::with_capacity(order.len());
    for series in order {
        let key = RangeVectorKey::from_carry_string(&series)?;
        let values = &selected[&series];
        let rows = grid
            .iter()
            .map(|ts| Row::sample(*ts, values.get(ts).copied().unwrap_or(f64::NAN)))
            .collect();
        out.push(MaterializedRangeVector::new(key, rows, range));
    }
    Ok(out)
}
