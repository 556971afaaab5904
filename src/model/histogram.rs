//! Schema-tagged histogram samples
//!
//! A histogram sample is a bucket-value array tagged with its bucket scheme.
//! Two histograms are additively combinable only when their schemes match;
//! adding mismatched histograms yields all-NaN bucket values, which
//! downstream aggregators observe and skip like any other NaN.

use serde::{Deserialize, Serialize};

/// The bucket layout of a histogram: ascending upper bounds, the last of
/// which is usually `+Inf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketScheme {
    upper_bounds: Vec<f64>,
}

impl BucketScheme {
    /// Create a scheme from ascending bucket upper bounds
    pub fn new(upper_bounds: Vec<f64>) -> Self {
        debug_assert!(upper_bounds.windows(2).all(|w| w[0] < w[1]));
        Self { upper_bounds }
    }

    /// Geometric bucket scheme with `count` buckets, the classic layout for
    /// latency histograms: `base, base*2, base*4, ..., +Inf`
    pub fn geometric(base: f64, count: usize) -> Self {
        let mut bounds: Vec<f64> = (0..count.saturating_sub(1))
            .map(|i| base * 2f64.powi(i as i32))
            .collect();
        bounds.push(f64::INFINITY);
        Self {
            upper_bounds: bounds,
        }
    }

    /// Number of buckets
    pub fn num_buckets(&self) -> usize {
        self.upper_bounds.len()
    }

    /// Bucket upper bounds
    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper_bounds
    }

    /// Whether two histograms with these schemes can be added bucket-wise
    pub fn matches(&self, other: &BucketScheme) -> bool {
        self.upper_bounds == other.upper_bounds
    }
}

/// One histogram sample: a scheme plus one value per bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramValue {
    scheme: BucketScheme,
    values: Vec<f64>,
}

impl HistogramValue {
    /// Create a histogram sample. `values.len()` must equal the scheme's
    /// bucket count.
    pub fn new(scheme: BucketScheme, values: Vec<f64>) -> Self {
        debug_assert_eq!(scheme.num_buckets(), values.len());
        Self { scheme, values }
    }

    /// The bucket scheme
    pub fn scheme(&self) -> &BucketScheme {
        &self.scheme
    }

    /// Bucket values
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of buckets
    pub fn num_buckets(&self) -> usize {
        self.values.len()
    }

    /// Add another histogram into this one.
    ///
    /// Matching schemes add bucket-wise with the usual NaN-skip discipline
    /// (a NaN bucket on either side contributes nothing unless both are
    /// NaN). A scheme mismatch poisons this histogram to all-NaN.
    pub fn add(&mut self, other: &HistogramValue) {
        if !self.scheme.matches(&other.scheme) {
            for v in &mut self.values {
                *v = f64::NAN;
            }
            return;
        }
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            if b.is_nan() {
                continue;
            }
            if a.is_nan() {
                *a = *b;
            } else {
                *a += *b;
            }
        }
    }

    /// Whether every bucket value is NaN
    pub fn is_all_nan(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(bounds: usize, values: Vec<f64>) -> HistogramValue {
        HistogramValue::new(BucketScheme::geometric(1.0, bounds), values)
    }

    #[test]
    fn test_matching_schemes_add_bucketwise() {
        let mut a = hist(4, vec![1.0, 2.0, 3.0, 4.0]);
        let b = hist(4, vec![10.0, 20.0, 30.0, 40.0]);
        a.add(&b);
        assert_eq!(a.values(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_mismatched_schemes_poison_to_nan() {
        let mut a = hist(8, vec![1.0; 8]);
        let b = hist(7, vec![1.0; 7]);
        a.add(&b);
        assert!(a.is_all_nan());
    }

    #[test]
    fn test_nan_buckets_are_skipped() {
        let mut a = hist(3, vec![f64::NAN, 2.0, 3.0]);
        let b = hist(3, vec![5.0, f64::NAN, 1.0]);
        a.add(&b);
        assert_eq!(a.values()[0], 5.0);
        assert_eq!(a.values()[1], 2.0);
        assert_eq!(a.values()[2], 4.0);
    }

    #[test]
    fn test_geometric_scheme_shape() {
        let scheme = BucketScheme::geometric(2.0, 4);
        assert_eq!(scheme.num_buckets(), 4);
        assert_eq!(&scheme.upper_bounds()[..3], &[2.0, 4.0, 8.0]);
        assert!(scheme.upper_bounds()[3].is_infinite());
    }
}
