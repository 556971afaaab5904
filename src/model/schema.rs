//! Result schemas and their reduction rules
//!
//! Every range-vector stream travels with a `ResultSchema` describing the
//! column layout of its rows. Non-leaf plans reduce their children's
//! schemas into one; reduction is associative, the empty schema is its
//! identity, and unequal non-empty schemas fail the query.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};

/// Column data types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Millisecond timestamp (always column 0)
    Timestamp,
    /// 64-bit float
    Double,
    /// Schema-tagged histogram
    Histogram,
    /// UTF-8 string
    String,
}

/// One column of a result schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Column data type
    pub column_type: ColumnType,
}

impl ColumnInfo {
    /// Create a column info
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column layout of a query result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSchema {
    /// Columns in row order; column 0 is the timestamp when non-empty
    pub columns: Vec<ColumnInfo>,
    /// Leading columns that form the row key (the timestamp)
    pub num_row_key_columns: usize,
    /// Fixed number of rows per vector when the output grid is known
    pub fixed_vector_len: Option<usize>,
}

impl ResultSchema {
    /// The empty schema: no columns, identity of schema reduction
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a schema with one row-key column (the timestamp)
    pub fn new(columns: Vec<ColumnInfo>, fixed_vector_len: Option<usize>) -> Self {
        Self {
            columns,
            num_row_key_columns: 1,
            fixed_vector_len,
        }
    }

    /// The usual `(timestamp, value)` sample schema
    pub fn sample_schema() -> Self {
        Self::new(
            vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("value", ColumnType::Double),
            ],
            None,
        )
    }

    /// The `(timestamp, histogram)` sample schema
    pub fn histogram_schema() -> Self {
        Self::new(
            vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("h", ColumnType::Histogram),
            ],
            None,
        )
    }

    /// Whether this is the empty schema
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column types in order
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }

    /// Whether the value column is a histogram
    pub fn is_histogram_value(&self) -> bool {
        self.columns
            .get(1)
            .map(|c| c.column_type == ColumnType::Histogram)
            .unwrap_or(false)
    }
}

/// Default schema reducer: the first non-empty schema wins and every later
/// non-empty schema must equal it.
pub fn reduce_schemas(acc: ResultSchema, next: &ResultSchema) -> Result<ResultSchema> {
    if acc.is_empty() {
        return Ok(next.clone());
    }
    if next.is_empty() {
        return Ok(acc);
    }
    if acc == *next {
        Ok(acc)
    } else {
        Err(QueryError::schema_mismatch(format!(
            "expected {:?}, got {:?}",
            acc.columns, next.columns
        )))
    }
}

/// Alternate reducer for plans that concatenate shards: column names and
/// vector lengths may differ as long as the column types line up;
/// `fixed_vector_len` values are summed.
pub fn reduce_schemas_ignoring_shape(acc: ResultSchema, next: &ResultSchema) -> Result<ResultSchema> {
    if acc.is_empty() {
        return Ok(next.clone());
    }
    if next.is_empty() {
        return Ok(acc);
    }
    if acc.column_types() != next.column_types() {
        return Err(QueryError::schema_mismatch(format!(
            "column types differ: {:?} vs {:?}",
            acc.column_types(),
            next.column_types()
        )));
    }
    let fixed_vector_len = match (acc.fixed_vector_len, next.fixed_vector_len) {
        (Some(a), Some(b)) => Some(a + b),
        _ => None,
    };
    Ok(ResultSchema {
        fixed_vector_len,
        ..acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_identity() {
        let s = ResultSchema::sample_schema();
        assert_eq!(reduce_schemas(ResultSchema::empty(), &s).unwrap(), s);
        assert_eq!(reduce_schemas(s.clone(), &ResultSchema::empty()).unwrap(), s);
    }

    #[test]
    fn test_equal_schemas_reduce_to_self() {
        let s = ResultSchema::sample_schema();
        assert_eq!(reduce_schemas(s.clone(), &s).unwrap(), s);
    }

    #[test]
    fn test_unequal_schemas_fail() {
        let a = ResultSchema::sample_schema();
        let b = ResultSchema::histogram_schema();
        let err = reduce_schemas(a, &b).unwrap_err();
        assert!(matches!(err, QueryError::SchemaMismatch(_)));
    }

    #[test]
    fn test_ignoring_shape_sums_fixed_len() {
        let mut a = ResultSchema::sample_schema();
        a.fixed_vector_len = Some(10);
        let mut b = ResultSchema::sample_schema();
        b.fixed_vector_len = Some(5);
        b.columns[1].name = "other".to_string();
        let reduced = reduce_schemas_ignoring_shape(a, &b).unwrap();
        assert_eq!(reduced.fixed_vector_len, Some(15));
    }

    #[test]
    fn test_reduction_is_associative() {
        let a = ResultSchema::sample_schema();
        let b = ResultSchema::empty();
        let c = ResultSchema::sample_schema();

        let left = reduce_schemas(reduce_schemas(a.clone(), &b).unwrap(), &c).unwrap();
        let right = reduce_schemas(a.clone(), &reduce_schemas(b, &c).unwrap()).unwrap();
        assert_eq!(left, right);
    }
}
