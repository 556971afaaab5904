//! Per-group, per-timestamp aggregation state
//!
//! One `AggAccumulator` lives for each `(group key, timestamp)` cell of a
//! running aggregation. Accumulators consume intermediate rows (the output
//! of the map phase, or of a downstream shard's reduce phase) and emit the
//! intermediate row for their timestamp on demand; combining is NaN-aware
//! throughout — a NaN input never disturbs accumulated state, and a cell
//! that only ever saw NaN emits NaN.

use crate::aggr::count_values::CountValuesAccumulator;
use crate::aggr::topk::TopKAccumulator;
use crate::error::{QueryError, Result};
use crate::model::{HistogramValue, Row, RowReader, RowValue};
use tdigest::TDigest;

/// Which statistic a `Stat` accumulator presents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Population standard deviation
    Stddev,
    /// Population variance
    Stdvar,
}

/// T-digest compression used for quantile intermediates
pub const DIGEST_COMPRESSION: usize = 100;

/// Aggregation state for one group/timestamp cell
#[derive(Debug, Clone)]
pub enum AggAccumulator {
    /// NaN-skipping running sum (also used for count reduction, which is a
    /// sum of mapped 1.0 cells)
    Sum {
        /// Running sum; NaN until the first non-NaN input
        value: f64,
    },

    /// Bucket-wise histogram sum
    SumHist {
        /// Running histogram; None until the first input
        value: Option<HistogramValue>,
    },

    /// NaN-skipping running minimum
    Min {
        /// Running minimum; NaN until the first non-NaN input
        value: f64,
    },

    /// NaN-skipping running maximum
    Max {
        /// Running maximum; NaN until the first non-NaN input
        value: f64,
    },

    /// 1.0 once any non-NaN input was seen
    Group {
        /// NaN or 1.0
        value: f64,
    },

    /// Weighted running mean
    Avg {
        /// Running mean; meaningless while count is 0
        mean: f64,
        /// Inputs folded in so far
        count: f64,
    },

    /// Running mean and M2 (Welford / Chan parallel combine)
    Stat {
        /// Statistic presented by this accumulator
        kind: StatKind,
        /// Running mean
        mean: f64,
        /// Sum of squared deviations from the mean
        m2: f64,
        /// Inputs folded in so far
        count: f64,
    },

    /// Bounded k-selection
    TopK(TopKAccumulator),

    /// Streaming quantile sketch
    Digest {
        /// Merged digest; None until the first non-empty input
        digest: Option<TDigest>,
    },

    /// Per-value occurrence counts
    CountValues(CountValuesAccumulator),
}

impl AggAccumulator {
    /// Fold one intermediate row into this accumulator. The row layout must
    /// match the accumulator kind (both derive from the same operator).
    pub fn reduce(&mut self, row: &Row) -> Result<()> {
        match self {
            AggAccumulator::Sum { value } => {
                let v = row.get_double(1);
                if !v.is_nan() {
                    *value = if value.is_nan() { v } else { *value + v };
                }
                Ok(())
            }
            AggAccumulator::SumHist { value } => {
                let h = row.get_histogram(1);
                match value {
                    Some(acc) => acc.add(h),
                    None => *value = Some(h.clone()),
                }
                Ok(())
            }
            AggAccumulator::Min { value } => {
                let v = row.get_double(1);
                if !v.is_nan() {
                    *value = if value.is_nan() { v } else { value.min(v) };
                }
                Ok(())
            }
            AggAccumulator::Max { value } => {
                let v = row.get_double(1);
                if !v.is_nan() {
                    *value = if value.is_nan() { v } else { value.max(v) };
                }
                Ok(())
            }
            AggAccumulator::Group { value } => {
                if !row.get_double(1).is_nan() {
                    *value = 1.0;
                }
                Ok(())
            }
            AggAccumulator::Avg { mean, count } => {
                let other_mean = row.get_double(1);
                let other_count = row.get_double(2);
                if other_count == 0.0 || other_mean.is_nan() {
                    return Ok(());
                }
                if *count == 0.0 {
                    *mean = other_mean;
                    *count = other_count;
                } else {
                    let combined = *count + other_count;
                    *mean = (*mean * *count + other_mean * other_count) / combined;
                    *count = combined;
                }
                Ok(())
            }
            AggAccumulator::Stat {
                kind,
                mean,
                m2,
                count,
            } => {
                let other_stat = row.get_double(1);
                let other_mean = row.get_double(2);
                let other_count = row.get_double(3);
                if other_count == 0.0 || other_mean.is_nan() {
                    return Ok(());
                }
                // recover M2 from the carried statistic
                let other_m2 = match kind {
                    StatKind::Stdvar => other_stat * other_count,
                    StatKind::Stddev => other_stat * other_stat * other_count,
                };
                let other_m2 = if other_m2.is_nan() { 0.0 } else { other_m2 };
                if *count == 0.0 {
                    *mean = other_mean;
                    *m2 = other_m2;
                    *count = other_count;
                } else {
                    let combined = *count + other_count;
                    let delta = other_mean - *mean;
                    *m2 += other_m2 + delta * delta * (*count * other_count / combined);
                    *mean += delta * (other_count / combined);
                    *count = combined;
                }
                Ok(())
            }
            AggAccumulator::TopK(acc) => acc.reduce_row(row),
            AggAccumulator::Digest { digest } => {
                let blob = row.get_str(1);
                let other: TDigest = serde_json::from_str(blob).map_err(|e| {
                    QueryError::internal(format!("undecodable digest intermediate: {e}"))
                })?;
                if other.is_empty() {
                    return Ok(());
                }
                *digest = Some(match digest.take() {
                    Some(cur) => TDigest::merge_digests(vec![cur, other]),
                    None => other,
                });
                Ok(())
            }
            AggAccumulator::CountValues(acc) => acc.reduce_row(row),
        }
    }

    /// Emit the intermediate row for this timestamp
    pub fn to_row(&self, timestamp: i64) -> Row {
        match self {
            AggAccumulator::Sum { value }
            | AggAccumulator::Min { value }
            | AggAccumulator::Max { value }
            | AggAccumulator::Group { value } => Row::sample(timestamp, *value),
            AggAccumulator::SumHist { value } => match value {
                Some(h) => Row::histogram_sample(timestamp, h.clone()),
                None => Row::sample(timestamp, f64::NAN),
            },
            AggAccumulator::Avg { mean, count } => {
                let mean = if *count == 0.0 { f64::NAN } else { *mean };
                Row::new(vec![
                    RowValue::Long(timestamp),
                    RowValue::Double(mean),
                    RowValue::Double(*count),
                ])
            }
            AggAccumulator::Stat {
                kind,
                mean,
                m2,
                count,
            } => {
                let (stat, mean) = if *count == 0.0 {
                    (f64::NAN, f64::NAN)
                } else {
                    let variance = m2 / count;
                    let stat = match kind {
                        StatKind::Stdvar => variance,
                        StatKind::Stddev => variance.sqrt(),
                    };
                    (stat, *mean)
                };
                Row::new(vec![
                    RowValue::Long(timestamp),
                    RowValue::Double(stat),
                    RowValue::Double(mean),
                    RowValue::Double(*count),
                ])
            }
            AggAccumulator::TopK(acc) => acc.to_row(timestamp),
            AggAccumulator::Digest { digest } => {
                let blob = match digest {
                    Some(d) => serde_json::to_string(d).unwrap_or_default(),
                    None => empty_digest_blob(),
                };
                Row::new(vec![RowValue::Long(timestamp), RowValue::Str(blob)])
            }
            AggAccumulator::CountValues(acc) => acc.to_row(timestamp),
        }
    }
}

/// Serialized form of a digest that has seen no values
pub fn empty_digest_blob() -> String {
    serde_json::to_string(&TDigest::new_with_size(DIGEST_COMPRESSION)).unwrap_or_default()
}

/// Serialize a single-value digest for the quantile map phase
pub fn single_value_digest_blob(value: f64) -> String {
    let digest = TDigest::new_with_size(DIGEST_COMPRESSION);
    let digest = if value.is_nan() {
        digest
    } else {
        digest.merge_unsorted(vec![value])
    };
    serde_json::to_string(&digest).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_skips_nan() {
        let mut acc = AggAccumulator::Sum { value: f64::NAN };
        for v in [f64::NAN, 4.6, 2.1] {
            acc.reduce(&Row::sample(1000, v)).unwrap();
        }
        assert_eq!(acc.to_row(1000), Row::sample(1000, 6.7));
    }

    #[test]
    fn test_sum_all_nan_is_nan() {
        let mut acc = AggAccumulator::Sum { value: f64::NAN };
        acc.reduce(&Row::sample(1000, f64::NAN)).unwrap();
        assert!(acc.to_row(1000).get_double(1).is_nan());
    }

    #[test]
    fn test_min_max_skip_nan() {
        let mut min = AggAccumulator::Min { value: f64::NAN };
        let mut max = AggAccumulator::Max { value: f64::NAN };
        for v in [5.6, f64::NAN, 2.1] {
            min.reduce(&Row::sample(0, v)).unwrap();
            max.reduce(&Row::sample(0, v)).unwrap();
        }
        assert_eq!(min.to_row(0).get_double(1), 2.1);
        assert_eq!(max.to_row(0).get_double(1), 5.6);
    }

    #[test]
    fn test_avg_weighted_merge() {
        let mut acc = AggAccumulator::Avg {
            mean: 0.0,
            count: 0.0,
        };
        // partial means from two shards: (10, 20) and (30, 40, 50)
        let left = Row::new(vec![
            RowValue::Long(0),
            RowValue::Double(15.0),
            RowValue::Double(2.0),
        ]);
        let right = Row::new(vec![
            RowValue::Long(0),
            RowValue::Double(40.0),
            RowValue::Double(3.0),
        ]);
        acc.reduce(&left).unwrap();
        acc.reduce(&right).unwrap();
        let row = acc.to_row(0);
        assert!((row.get_double(1) - 30.0).abs() < 1e-9);
        assert_eq!(row.get_double(2), 5.0);
    }

    #[test]
    fn test_stat_chan_combine_matches_single_pass() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        // single accumulator over all values (count-1 rows from the map phase)
        let mut whole = AggAccumulator::Stat {
            kind: StatKind::Stdvar,
            mean: 0.0,
            m2: 0.0,
            count: 0.0,
        };
        for v in data {
            let row = Row::new(vec![
                RowValue::Long(0),
                RowValue::Double(0.0),
                RowValue::Double(v),
                RowValue::Double(1.0),
            ]);
            whole.reduce(&row).unwrap();
        }
        // split into two partials and merge
        let mut split = AggAccumulator::Stat {
            kind: StatKind::Stdvar,
            mean: 0.0,
            m2: 0.0,
            count: 0.0,
        };
        for part in [&data[..4], &data[4..]] {
            let mut partial = AggAccumulator::Stat {
                kind: StatKind::Stdvar,
                mean: 0.0,
                m2: 0.0,
                count: 0.0,
            };
            for v in part {
                let row = Row::new(vec![
                    RowValue::Long(0),
                    RowValue::Double(0.0),
                    RowValue::Double(*v),
                    RowValue::Double(1.0),
                ]);
                partial.reduce(&row).unwrap();
            }
            split.reduce(&partial.to_row(0)).unwrap();
        }

        let variance = whole.to_row(0).get_double(1);
        assert!((variance - 4.0).abs() < 1e-9);
        assert!((split.to_row(0).get_double(1) - variance).abs() < 1e-9);
    }

    #[test]
    fn test_digest_merge_roundtrip() {
        let mut acc = AggAccumulator::Digest { digest: None };
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            let row = Row::new(vec![
                RowValue::Long(0),
                RowValue::Str(single_value_digest_blob(v)),
            ]);
            acc.reduce(&row).unwrap();
        }
        let row = acc.to_row(0);
        let digest: TDigest = serde_json::from_str(row.get_str(1)).unwrap();
        let median = digest.estimate_quantile(0.5);
        assert!((median - 3.0).abs() < 0.5);
    }

    #[test]
    fn test_group_emits_one() {
        let mut acc = AggAccumulator::Group { value: f64::NAN };
        acc.reduce(&Row::sample(0, f64::NAN)).unwrap();
        assert!(acc.to_row(0).get_double(1).is_nan());
        acc.reduce(&Row::sample(0, 123.0)).unwrap();
        assert_eq!(acc.to_row(0).get_double(1), 1.0);
    }
}
