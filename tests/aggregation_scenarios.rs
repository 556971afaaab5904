//! End-to-end scenarios for the grouped aggregation pipeline
//!
//! These tests drive the two-phase map/reduce engine the way a composed
//! plan does: map+reduce over raw series, optionally a second reduce layer
//! over intermediates, then the present phase. They pin down the NaN
//! semantics, the k-selection fill rules, histogram bucket arithmetic, and
//! the t-digest round trip through serialized vectors.

use borealis_query::aggr::{AggregateOperator, AggregationGrouping, RangeVectorAggregator};
use borealis_query::model::{
    stream_from_vectors, BucketScheme, HistogramValue, MaterializedRangeVector, RangeVector,
    RangeVectorKey, RangeVectorStream, RecordBuilder, ResultSchema, Row, RowReader, RvRange,
    SerializedRangeVector,
};
use futures::TryStreamExt;

// ============================================================================
// Helpers
// ============================================================================

fn series(instance: &str, samples: &[(i64, f64)]) -> MaterializedRangeVector {
    MaterializedRangeVector::from_samples(
        RangeVectorKey::from_pairs([("instance", instance)]),
        samples,
        None,
    )
}

fn stream_of(series: Vec<MaterializedRangeVector>) -> RangeVectorStream {
    stream_from_vectors(series.into_iter().map(|s| Box::new(s) as _).collect())
}

async fn map_reduce(
    op: AggregateOperator,
    source: RangeVectorStream,
) -> Vec<Box<dyn RangeVector>> {
    RangeVectorAggregator::map_reduce(op, false, source, AggregationGrouping::All, 4, None)
        .try_collect()
        .await
        .unwrap()
}

async fn present(
    op: AggregateOperator,
    reduced: Vec<Box<dyn RangeVector>>,
    range: Option<RvRange>,
) -> Vec<Box<dyn RangeVector>> {
    RangeVectorAggregator::present(op, stream_from_vectors(reduced), 1_000_000, range)
        .try_collect()
        .await
        .unwrap()
}

fn values_of(rv: &dyn RangeVector) -> Vec<(i64, f64)> {
    rv.rows().map(|r| (r.timestamp(), r.get_double(1))).collect()
}

/// The three series shared by S1 and S3
fn s1_input() -> Vec<MaterializedRangeVector> {
    vec![
        series("a", &[(1000, f64::NAN), (2000, 5.6)]),
        series("b", &[(1000, 4.6), (2000, 4.4)]),
        series("c", &[(1000, 2.1), (2000, 5.4)]),
    ]
}

// ============================================================================
// Literal scenarios
// ============================================================================

#[tokio::test]
async fn s1_sum_with_nan() {
    let reduced = map_reduce(AggregateOperator::Sum, stream_of(s1_input())).await;
    let out = present(AggregateOperator::Sum, reduced, None).await;

    assert_eq!(out.len(), 1);
    let values = values_of(out[0].as_ref());
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].0, 1000);
    assert!((values[0].1 - 6.7).abs() < 1e-9);
    assert_eq!(values[1].0, 2000);
    assert!((values[1].1 - 15.4).abs() < 1e-9);
}

#[tokio::test]
async fn s2_avg_fills_nan_gaps_from_other_series() {
    // alternating NaN gaps; wherever one series is NaN the other has 1.0
    let a = series(
        "a",
        &[
            (1000, 1.0),
            (2000, f64::NAN),
            (3000, 1.0),
            (4000, f64::NAN),
            (5000, 1.0),
            (6000, f64::NAN),
            (7000, 1.0),
        ],
    );
    let b = series(
        "b",
        &[
            (1000, f64::NAN),
            (2000, 1.0),
            (3000, f64::NAN),
            (4000, 1.0),
            (5000, f64::NAN),
            (6000, 1.0),
            (7000, f64::NAN),
        ],
    );
    let reduced = map_reduce(AggregateOperator::Avg, stream_of(vec![a, b])).await;
    let out = present(AggregateOperator::Avg, reduced, None).await;

    assert_eq!(out.len(), 1);
    let values: Vec<f64> = values_of(out[0].as_ref()).iter().map(|(_, v)| *v).collect();
    assert_eq!(values, vec![1.0; 7]);
}

#[tokio::test]
async fn s3_bottomk_intermediates_and_present() {
    let reduced = map_reduce(AggregateOperator::BottomK(2), stream_of(s1_input())).await;
    assert_eq!(reduced.len(), 1);

    // intermediate rows carry the two smallest values per timestamp
    let rows: Vec<Row> = reduced[0].rows().collect();
    let slot_values = |row: &Row| {
        let mut v = vec![row.get_double(1), row.get_double(3)];
        v.sort_by(f64::total_cmp);
        v
    };
    assert_eq!(slot_values(&rows[0]), vec![2.1, 4.6]);
    assert_eq!(slot_values(&rows[1]), vec![4.4, 5.4]);

    let out = present(AggregateOperator::BottomK(2), reduced, None).await;
    assert_eq!(out.len(), 2);

    // first-selected order: c (2.1 at t=1000) before b (4.6 at t=1000)
    let c = values_of(out[0].as_ref());
    assert_eq!(out[0].key().value("instance"), Some("c"));
    assert!((c[0].1 - 2.1).abs() < 1e-9);
    assert!((c[1].1 - 5.4).abs() < 1e-9);

    let b = values_of(out[1].as_ref());
    assert_eq!(out[1].key().value("instance"), Some("b"));
    assert!((b[0].1 - 4.6).abs() < 1e-9);
    assert!((b[1].1 - 4.4).abs() < 1e-9);
}

#[tokio::test]
async fn s4_topk_all_nan_timestamp_stays_nan() {
    let input = vec![
        series("a", &[(1000, f64::NAN), (2000, 3.0)]),
        series("b", &[(1000, f64::NAN), (2000, 7.0)]),
    ];
    let reduced = map_reduce(AggregateOperator::TopK(1), stream_of(input)).await;
    let out = present(AggregateOperator::TopK(1), reduced, None).await;

    // only b is ever selected; at the all-NaN timestamp its value is NaN
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key().value("instance"), Some("b"));
    let values = values_of(out[0].as_ref());
    assert!(values[0].1.is_nan());
    assert_eq!(values[1].1, 7.0);
}

#[tokio::test]
async fn s5_histogram_sum_equal_and_mismatched_schemes() {
    let scheme8 = BucketScheme::geometric(1.0, 8);
    let hist = |scheme: &BucketScheme, base: f64| {
        HistogramValue::new(
            scheme.clone(),
            (0..scheme.num_buckets()).map(|i| base + i as f64).collect(),
        )
    };
    let hseries = |name: &str, h: HistogramValue| {
        MaterializedRangeVector::new(
            RangeVectorKey::from_pairs([("instance", name)]),
            vec![Row::histogram_sample(1000, h)],
            None,
        )
    };

    // equal schemes: element-wise sum
    let input = vec![
        hseries("a", hist(&scheme8, 1.0)),
        hseries("b", hist(&scheme8, 10.0)),
    ];
    let reduced = map_reduce(AggregateOperator::Sum, stream_of(input)).await;
    let rows: Vec<Row> = reduced[0].rows().collect();
    let summed = rows[0].get_histogram(1);
    let expected: Vec<f64> = (0..8).map(|i| 11.0 + 2.0 * i as f64).collect();
    assert_eq!(summed.values(), &expected[..]);

    // mismatched bucket counts (8 vs 7): every bucket of the sum is NaN
    let scheme7 = BucketScheme::geometric(1.0, 7);
    let input = vec![
        hseries("a", hist(&scheme8, 1.0)),
        hseries("b", hist(&scheme7, 10.0)),
    ];
    let reduced = map_reduce(AggregateOperator::Sum, stream_of(input)).await;
    let rows: Vec<Row> = reduced[0].rows().collect();
    assert!(rows[0].get_histogram(1).is_all_nan());
}

#[tokio::test]
async fn s6_quantile_roundtrip_through_serialized_vector() {
    let samples: Vec<(i64, f64)> = (1..=100).map(|i| (1000, i as f64)).collect();
    let input: Vec<MaterializedRangeVector> = samples
        .chunks(10)
        .enumerate()
        .map(|(i, chunk)| series(&format!("s{i}"), chunk))
        .collect();

    let op = AggregateOperator::Quantile(0.5);
    let reduced = map_reduce(op.clone(), stream_of(input)).await;
    assert_eq!(reduced.len(), 1);

    // serialize the digest intermediate and present from the decoded copy
    let reduction_schema = op.reduction_schema(&ResultSchema::sample_schema());
    let builder = RecordBuilder::shared();
    let srv = SerializedRangeVector::materialize(
        reduced[0].as_ref(),
        &builder,
        &reduction_schema,
        "QuantileTest",
    )
    .unwrap();
    assert_eq!(srv.num_rows_serialized(), 1);

    let out = present(op, vec![Box::new(srv)], None).await;
    assert_eq!(out.len(), 1);
    let median = values_of(out[0].as_ref())[0].1;
    assert!(
        (median - 50.0).abs() <= 2.0,
        "median estimate {median} outside tolerance"
    );
}

// ============================================================================
// Invariant properties
// ============================================================================

#[tokio::test]
async fn partition_invariance_for_commutative_operators() {
    let a = series("a", &[(1000, 2.0), (2000, f64::NAN), (3000, 8.0)]);
    let b = series("b", &[(1000, 4.0), (2000, 6.0), (3000, f64::NAN)]);
    let c = series("c", &[(1000, f64::NAN), (2000, 1.0), (3000, 5.0)]);

    for op in [
        AggregateOperator::Sum,
        AggregateOperator::Min,
        AggregateOperator::Max,
        AggregateOperator::Count,
        AggregateOperator::Avg,
        AggregateOperator::Stddev,
        AggregateOperator::Stdvar,
        AggregateOperator::Group,
    ] {
        let forward = map_reduce(
            op.clone(),
            stream_of(vec![a.clone(), b.clone(), c.clone()]),
        )
        .await;
        let reversed = map_reduce(
            op.clone(),
            stream_of(vec![c.clone(), b.clone(), a.clone()]),
        )
        .await;
        let fw = present(op.clone(), forward, None).await;
        let rv = present(op.clone(), reversed, None).await;

        let fw = values_of(fw[0].as_ref());
        let rv = values_of(rv[0].as_ref());
        assert_eq!(fw.len(), rv.len(), "{op:?}");
        for ((t1, v1), (t2, v2)) in fw.into_iter().zip(rv) {
            assert_eq!(t1, t2, "{op:?}");
            assert!(
                (v1.is_nan() && v2.is_nan()) || (v1 - v2).abs() < 1e-9,
                "{op:?}: {v1} vs {v2} at {t1}"
            );
        }
    }
}

#[tokio::test]
async fn nan_semantics_all_nan_timestamp_yields_nan() {
    let input = vec![
        series("a", &[(1000, f64::NAN), (2000, 2.0)]),
        series("b", &[(1000, f64::NAN), (2000, 4.0)]),
    ];
    let cases: Vec<(AggregateOperator, f64)> = vec![
        (AggregateOperator::Sum, 6.0),
        (AggregateOperator::Count, 2.0),
        (AggregateOperator::Min, 2.0),
        (AggregateOperator::Max, 4.0),
        (AggregateOperator::Avg, 3.0),
        (AggregateOperator::Stddev, 1.0),
        (AggregateOperator::Stdvar, 1.0),
        (AggregateOperator::Group, 1.0),
    ];
    for (op, expected_at_2000) in cases {
        let reduced = map_reduce(op.clone(), stream_of(input.clone())).await;
        let out = present(op.clone(), reduced, None).await;
        let values = values_of(out[0].as_ref());
        assert!(values[0].1.is_nan(), "{op:?} at all-NaN timestamp");
        assert!(
            (values[1].1 - expected_at_2000).abs() < 1e-9,
            "{op:?}: got {}, expected {expected_at_2000}",
            values[1].1
        );
    }
}

#[tokio::test]
async fn topk_fill_counts_match_candidates() {
    // at t=1000 only one candidate, at t=2000 three; k=2
    let input = vec![
        series("a", &[(1000, 5.0), (2000, 1.0)]),
        series("b", &[(1000, f64::NAN), (2000, 2.0)]),
        series("c", &[(1000, f64::NAN), (2000, 3.0)]),
    ];
    let reduced = map_reduce(AggregateOperator::TopK(2), stream_of(input)).await;
    let rows: Vec<Row> = reduced[0].rows().collect();

    let filled = |row: &Row| {
        (0..2)
            .filter(|slot| row.get_double(2 * slot + 1) != -f64::MAX)
            .count()
    };
    assert_eq!(filled(&rows[0]), 1);
    assert_eq!(filled(&rows[1]), 2);

    // present maps slots back to keys; non-selected timestamps are NaN
    let out = present(AggregateOperator::TopK(2), reduced, None).await;
    assert_eq!(out.len(), 3);
    for rv in &out {
        let values = values_of(rv.as_ref());
        match rv.key().value("instance") {
            Some("a") => {
                assert_eq!(values[0].1, 5.0);
                assert!(values[1].1.is_nan());
            }
            Some("b") => {
                assert!(values[0].1.is_nan());
                assert_eq!(values[1].1, 2.0);
            }
            Some("c") => {
                assert!(values[0].1.is_nan());
                assert_eq!(values[1].1, 3.0);
            }
            other => panic!("unexpected series {other:?}"),
        }
    }
}

#[tokio::test]
async fn count_values_fans_out_per_formatted_value() {
    let input = vec![
        series("a", &[(1000, 2.0), (2000, 5.6)]),
        series("b", &[(1000, 2.0), (2000, 2.0)]),
    ];
    let op = AggregateOperator::CountValues("value".to_string());
    let reduced = map_reduce(op.clone(), stream_of(input)).await;
    let out = present(op, reduced, None).await;

    assert_eq!(out.len(), 2);
    let two = &out[0];
    assert_eq!(two.key().value("value"), Some("2.0"));
    let values = values_of(two.as_ref());
    assert_eq!(values[0].1, 2.0);
    assert_eq!(values[1].1, 1.0);

    let five_six = &out[1];
    assert_eq!(five_six.key().value("value"), Some("5.6"));
    let values = values_of(five_six.as_ref());
    assert!(values[0].1.is_nan());
    assert_eq!(values[1].1, 1.0);
}

#[tokio::test]
async fn grouped_aggregation_partitions_by_clause() {
    let mk = |dc: &str, host: &str, v: f64| {
        MaterializedRangeVector::from_samples(
            RangeVectorKey::from_pairs([("dc", dc), ("host", host)]),
            &[(1000, v)],
            None,
        )
    };
    let input = vec![
        mk("east", "h1", 1.0),
        mk("east", "h2", 2.0),
        mk("west", "h3", 4.0),
    ];
    let reduced = RangeVectorAggregator::map_reduce(
        AggregateOperator::Sum,
        false,
        stream_of(input),
        AggregationGrouping::By(vec!["dc".to_string()]),
        4,
        None,
    )
    .try_collect::<Vec<_>>()
    .await
    .unwrap();

    assert_eq!(reduced.len(), 2);
    assert_eq!(reduced[0].key().value("dc"), Some("east"));
    assert_eq!(values_of(reduced[0].as_ref())[0].1, 3.0);
    assert_eq!(reduced[1].key().value("dc"), Some("west"));
    assert_eq!(values_of(reduced[1].as_ref())[0].1, 4.0);
}
