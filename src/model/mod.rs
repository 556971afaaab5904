//! Core data model for range-vector query execution
//!
//! This module provides the building blocks the aggregation pipeline and the
//! execution-plan runtime operate on:
//! - Label keys identifying a series (`RangeVectorKey`)
//! - Typed rows with positional accessors (`Row`, `RowReader`)
//! - Range vectors: one labeled series of rows over a query window
//! - Schema-tagged histogram samples with bucket arithmetic
//! - Result schemas and their reduction rules
//! - Serialized range vectors backed by shared byte containers

pub mod histogram;
pub mod key;
pub mod range_vector;
pub mod row;
pub mod schema;
pub mod serialized;

pub use histogram::{BucketScheme, HistogramValue};
pub use key::RangeVectorKey;
pub use range_vector::{
    empty_stream, stream_from_vectors, MaterializedRangeVector, RangeVector, RangeVectorStream,
    RvRange, ScalarFixedDouble, ScalarVaryingDouble,
};
pub use row::{Row, RowReader, RowValue, TransientRow};
pub use schema::{
    reduce_schemas, reduce_schemas_ignoring_shape, ColumnInfo, ColumnType, ResultSchema,
};
pub use serialized::{RecordBuilder, SerializedRangeVector, SharedRecordBuilder};
