//! Serialized range vectors backed by shared byte containers
//!
//! `RecordBuilder` encodes rows into a small number of contiguous byte
//! containers; one builder is shared across every range vector materialized
//! for a query so container memory is pooled and total result bytes are
//! retrievable for accounting. The builder is single-writer: rows are
//! appended from one materializer task at a time, and readers only decode
//! after their vector is fully appended.
//!
//! Containers live until query completion; a `SerializedRangeVector` holds
//! the builder handle plus row locators and decodes on demand, so its
//! cursor is restartable.

use crate::error::{QueryError, Result};
use crate::model::histogram::{BucketScheme, HistogramValue};
use crate::model::key::RangeVectorKey;
use crate::model::range_vector::{RangeVector, RvRange};
use crate::model::row::{Row, RowValue};
use crate::model::schema::{ColumnType, ResultSchema};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Default size of one byte container
pub const DEFAULT_CONTAINER_SIZE: usize = 64 * 1024;

/// Position of one encoded row inside a builder
#[derive(Debug, Clone, Copy)]
struct RowLocator {
    container: u32,
    offset: u32,
    len: u32,
}

/// Reusable encoder of rows into pooled byte containers
#[derive(Debug)]
pub struct RecordBuilder {
    container_size: usize,
    containers: Vec<BytesMut>,
    scratch: Vec<u8>,
}

/// The builder handle shared by all vectors of one query execution
pub type SharedRecordBuilder = Arc<RwLock<RecordBuilder>>;

impl RecordBuilder {
    /// Create a builder with the given container size
    pub fn new(container_size: usize) -> Self {
        Self {
            container_size: container_size.max(1024),
            containers: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Create a shareable builder with the default container size
    pub fn shared() -> SharedRecordBuilder {
        Arc::new(RwLock::new(Self::new(DEFAULT_CONTAINER_SIZE)))
    }

    /// Bytes used per container
    pub fn container_byte_counts(&self) -> Vec<usize> {
        self.containers.iter().map(|c| c.len()).collect()
    }

    /// Total bytes across all containers
    pub fn total_bytes(&self) -> usize {
        self.containers.iter().map(|c| c.len()).sum()
    }

    /// Encode one row according to `schema`, returning its locator
    fn append_row(&mut self, schema: &ResultSchema, row: &Row) -> Result<RowLocator> {
        if row.num_cols() != schema.columns.len() {
            return Err(QueryError::internal(format!(
                "row has {} columns, schema expects {}",
                row.num_cols(),
                schema.columns.len()
            )));
        }
        self.scratch.clear();
        for (cell, col) in row.cells().iter().zip(schema.columns.iter()) {
            encode_cell(&mut self.scratch, cell, col.column_type)?;
        }

        let need = self.scratch.len();
        let start_new = match self.containers.last() {
            Some(c) => c.len() + need > self.container_size && c.len() > 0,
            None => true,
        };
        if start_new {
            self.containers
                .push(BytesMut::with_capacity(self.container_size.max(need)));
        }
        let idx = self.containers.len() - 1;
        let container = &mut self.containers[idx];
        let offset = container.len();
        container.extend_from_slice(&self.scratch);
        Ok(RowLocator {
            container: idx as u32,
            offset: offset as u32,
            len: need as u32,
        })
    }

    /// Decode the row at `locator`. Locators are only produced by
    /// `append_row`, so the bytes always match the schema layout.
    fn read_row(&self, schema: &ResultSchema, locator: RowLocator) -> Row {
        let container = &self.containers[locator.container as usize];
        let start = locator.offset as usize;
        let end = start + locator.len as usize;
        let mut buf = &container[start..end];
        let cells = schema
            .columns
            .iter()
            .map(|col| decode_cell(&mut buf, col.column_type))
            .collect();
        Row::new(cells)
    }
}

fn encode_cell(out: &mut Vec<u8>, cell: &RowValue, expected: ColumnType) -> Result<()> {
    match (cell, expected) {
        (RowValue::Long(v), ColumnType::Timestamp) => out.put_i64_le(*v),
        (RowValue::Double(v), ColumnType::Double) => out.put_f64_le(*v),
        (RowValue::Str(s), ColumnType::String) => {
            out.put_u32_le(s.len() as u32);
            out.extend_from_slice(s.as_bytes());
        }
        (RowValue::Histogram(h), ColumnType::Histogram) => {
            out.put_u16_le(h.num_buckets() as u16);
            for b in h.scheme().upper_bounds() {
                out.put_f64_le(*b);
            }
            for v in h.values() {
                out.put_f64_le(*v);
            }
        }
        (cell, expected) => {
            return Err(QueryError::internal(format!(
                "cell {cell:?} does not fit column type {expected:?}"
            )))
        }
    }
    Ok(())
}

fn decode_cell(buf: &mut &[u8], column_type: ColumnType) -> RowValue {
    match column_type {
        ColumnType::Timestamp => RowValue::Long(buf.get_i64_le()),
        ColumnType::Double => RowValue::Double(buf.get_f64_le()),
        ColumnType::String => {
            let len = buf.get_u32_le() as usize;
            let s = String::from_utf8_lossy(&buf[..len]).into_owned();
            buf.advance(len);
            RowValue::Str(s)
        }
        ColumnType::Histogram => {
            let buckets = buf.get_u16_le() as usize;
            let bounds = (0..buckets).map(|_| buf.get_f64_le()).collect();
            let values = (0..buckets).map(|_| buf.get_f64_le()).collect();
            RowValue::Histogram(HistogramValue::new(BucketScheme::new(bounds), values))
        }
    }
}

/// A range vector materialized into builder containers
pub struct SerializedRangeVector {
    key: RangeVectorKey,
    schema: ResultSchema,
    builder: SharedRecordBuilder,
    locators: Vec<RowLocator>,
    output_range: Option<RvRange>,
    plan_name: String,
}

impl SerializedRangeVector {
    /// Drain `rv`'s cursor into the shared builder.
    ///
    /// `plan_name` records which plan materialized the vector, for error
    /// messages and metrics.
    pub fn materialize(
        rv: &dyn RangeVector,
        builder: &SharedRecordBuilder,
        schema: &ResultSchema,
        plan_name: &str,
    ) -> Result<Self> {
        let mut locators = Vec::new();
        {
            let mut b = builder.write();
            for row in rv.rows() {
                locators.push(b.append_row(schema, &row).map_err(|e| {
                    QueryError::internal(format!("{plan_name} failed to serialize row: {e}"))
                })?);
            }
        }
        Ok(Self {
            key: rv.key().clone(),
            schema: schema.clone(),
            builder: Arc::clone(builder),
            locators,
            output_range: rv.output_range(),
            plan_name: plan_name.to_string(),
        })
    }

    /// Rows appended for this vector
    pub fn num_rows_serialized(&self) -> usize {
        self.locators.len()
    }

    /// Size of the key labels, counted into result bytes
    pub fn key_size_bytes(&self) -> usize {
        self.key.size_bytes()
    }

    /// The schema the rows were encoded with
    pub fn schema(&self) -> &ResultSchema {
        &self.schema
    }

    /// Plan that materialized this vector
    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    /// Decode all rows into owned form
    pub fn decode_rows(&self) -> Vec<Row> {
        let b = self.builder.read();
        self.locators
            .iter()
            .map(|loc| b.read_row(&self.schema, *loc))
            .collect()
    }
}

impl RangeVector for SerializedRangeVector {
    fn key(&self) -> &RangeVectorKey {
        &self.key
    }

    fn output_range(&self) -> Option<RvRange> {
        self.output_range
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Row> + Send + '_> {
        Box::new(self.decode_rows().into_iter())
    }
}

impl fmt::Debug for SerializedRangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedRangeVector")
            .field("key", &self.key)
            .field("num_rows", &self.locators.len())
            .field("plan", &self.plan_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::range_vector::MaterializedRangeVector;
    use crate::model::row::RowReader;

    #[test]
    fn test_roundtrip_sample_rows() {
        let rv = MaterializedRangeVector::from_samples(
            RangeVectorKey::from_pairs([("job", "api")]),
            &[(1000, 1.5), (2000, f64::NAN), (3000, 2.5)],
            None,
        );
        let builder = RecordBuilder::shared();
        let schema = ResultSchema::sample_schema();
        let srv = SerializedRangeVector::materialize(&rv, &builder, &schema, "TestExec").unwrap();

        assert_eq!(srv.num_rows_serialized(), 3);
        let rows: Vec<Row> = srv.rows().collect();
        assert_eq!(rows[0], Row::sample(1000, 1.5));
        assert!(rows[1].get_double(1).is_nan());
        assert_eq!(rows[2], Row::sample(3000, 2.5));
        // cursor restarts
        assert_eq!(srv.rows().count(), 3);
    }

    #[test]
    fn test_builder_shared_across_vectors() {
        let builder = RecordBuilder::shared();
        let schema = ResultSchema::sample_schema();
        for i in 0..4 {
            let rv = MaterializedRangeVector::from_samples(
                RangeVectorKey::from_pairs([("i", i.to_string())]),
                &[(1000, i as f64)],
                None,
            );
            SerializedRangeVector::materialize(&rv, &builder, &schema, "TestExec").unwrap();
        }
        let b = builder.read();
        // 4 rows of 16 bytes share one container
        assert_eq!(b.container_byte_counts(), vec![64]);
        assert_eq!(b.total_bytes(), 64);
    }

    #[test]
    fn test_containers_roll_over() {
        let builder = Arc::new(RwLock::new(RecordBuilder::new(1024)));
        let schema = ResultSchema::sample_schema();
        let samples: Vec<(i64, f64)> = (0..100).map(|i| (i as i64 * 1000, i as f64)).collect();
        let rv = MaterializedRangeVector::from_samples(RangeVectorKey::empty(), &samples, None);
        let srv = SerializedRangeVector::materialize(&rv, &builder, &schema, "TestExec").unwrap();

        assert_eq!(srv.num_rows_serialized(), 100);
        assert!(builder.read().container_byte_counts().len() > 1);
        assert_eq!(builder.read().total_bytes(), 100 * 16);
        assert_eq!(srv.rows().count(), 100);
    }

    #[test]
    fn test_histogram_and_string_roundtrip() {
        let schema = ResultSchema::new(
            vec![
                crate::model::schema::ColumnInfo::new("timestamp", ColumnType::Timestamp),
                crate::model::schema::ColumnInfo::new("h", ColumnType::Histogram),
                crate::model::schema::ColumnInfo::new("tag", ColumnType::String),
            ],
            None,
        );
        let hist = HistogramValue::new(BucketScheme::new(vec![1.0, 2.0]), vec![3.0, 4.0]);
        let row = Row::new(vec![
            RowValue::Long(500),
            RowValue::Histogram(hist.clone()),
            RowValue::Str("alpha".to_string()),
        ]);
        let rv = MaterializedRangeVector::new(RangeVectorKey::empty(), vec![row.clone()], None);
        let builder = RecordBuilder::shared();
        let srv = SerializedRangeVector::materialize(&rv, &builder, &schema, "TestExec").unwrap();

        let decoded: Vec<Row> = srv.rows().collect();
        assert_eq!(decoded, vec![row]);
        assert_eq!(decoded[0].get_histogram(1), &hist);
        assert_eq!(decoded[0].get_str(2), "alpha");
    }

    #[test]
    fn test_schema_arity_mismatch_fails() {
        let rv = MaterializedRangeVector::new(
            RangeVectorKey::empty(),
            vec![Row::new(vec![RowValue::Long(0)])],
            None,
        );
        let builder = RecordBuilder::shared();
        let schema = ResultSchema::sample_schema();
        let err =
            SerializedRangeVector::materialize(&rv, &builder, &schema, "TestExec").unwrap_err();
        assert!(matches!(err, QueryError::Internal(_)));
    }
}
