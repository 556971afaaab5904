//! Error types for query execution
//!
//! Provides structured error handling for the aggregation pipeline and the
//! execution-plan runtime. Every failure inside the pipeline is eventually
//! converted into a `QueryErrorResponse` so that callers always receive a
//! `QueryResponse`; the variants here are the payload of that conversion.

use thiserror::Error;

/// Main error type for query execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Query exceeded its configured time limit
    #[error("query timed out after {elapsed_ms} ms (limit {timeout_ms} ms)")]
    Timeout {
        /// Milliseconds elapsed since query submission
        elapsed_ms: u64,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Materialized sample count exceeded the configured limit
    #[error("sample limit exceeded: {actual} samples materialized, limit is {limit}")]
    SampleLimitExceeded {
        /// Configured sample limit
        limit: usize,
        /// Number of samples materialized when the limit tripped
        actual: usize,
    },

    /// Child plans returned inconsistent result schemas
    #[error("result schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Query parameters are out of range (k <= 0, quantile outside [0,1], ...)
    #[error("bad query: {0}")]
    BadQuery(String),

    /// A dispatched child plan returned an error response
    #[error("child plan {child} failed: {message}")]
    ChildFailure {
        /// Positional index of the failed child
        child: usize,
        /// Error message reported by the child
        message: String,
    },

    /// The series source failed while producing raw rows
    #[error("series source error: {0}")]
    Source(String),

    /// Internal error (bug, unexpected state)
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Create a bad-query error
    pub fn bad_query(message: impl Into<String>) -> Self {
        QueryError::BadQuery(message.into())
    }

    /// Create a schema-mismatch error
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        QueryError::SchemaMismatch(message.into())
    }

    /// Create a series-source error
    pub fn source(message: impl Into<String>) -> Self {
        QueryError::Source(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        QueryError::Internal(message.into())
    }

    /// Whether this error came from a timeout check
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::Timeout { .. })
    }
}

/// Result type alias for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueryError::SampleLimitExceeded {
            limit: 1000,
            actual: 1001,
        };
        let display = format!("{}", err);
        assert!(display.contains("1000"));
        assert!(display.contains("1001"));
    }

    #[test]
    fn test_bad_query_helper() {
        let err = QueryError::bad_query("topk needs k >= 1, got 0");
        assert!(matches!(err, QueryError::BadQuery(_)));
        assert!(format!("{}", err).contains("topk"));
    }

    #[test]
    fn test_is_timeout() {
        let err = QueryError::Timeout {
            elapsed_ms: 31_000,
            timeout_ms: 30_000,
        };
        assert!(err.is_timeout());
        assert!(!QueryError::internal("x").is_timeout());
    }
}
