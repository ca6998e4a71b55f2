//! Error taxonomy for the allocation store and the analysis operations.
//!
//! "No records" is not an error: lookups return `Ok(None)` and population queries return
//! zero-valued results. Only store failures, malformed input and inconsistent data surface here.

use std::time::Duration;
use thiserror::Error;

/// Failures raised by an [`AllocationStore`](crate::store::AllocationStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend could not serve the query (I/O, lock, driver error).
    #[error("allocation store unavailable: {0}")]
    Unavailable(String),

    /// Query exceeded its deadline.
    #[error("allocation store query timed out after {after:?}")]
    Timeout { after: Duration },

    /// A row failed validation at the store boundary.
    #[error("malformed allocation row: {field}: {reason}")]
    MalformedRow { field: String, reason: String },
}

impl StoreError {
    /// Transient failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(idx, _, inner) => StoreError::MalformedRow {
                field: format!("column {}", idx),
                reason: inner.to_string(),
            },
            rusqlite::Error::InvalidColumnType(idx, name, ty) => StoreError::MalformedRow {
                field: name,
                reason: format!("column {} has unexpected type {}", idx, ty),
            },
            // Only a deadline on the awaiting side interrupts a statement.
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                StoreError::Timeout {
                    after: Duration::ZERO,
                }
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Failures of an analysis request.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// Input rejected before any store query was issued.
    #[error("invalid filter '{field}': {reason}")]
    InvalidFilter { field: &'static str, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stored facts contradict the allocation invariants (e.g. two records in one round).
    #[error("inconsistent allocation data: {0}")]
    InconsistentData(String),
}

impl AnalysisError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        AnalysisError::InvalidFilter {
            field,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;
