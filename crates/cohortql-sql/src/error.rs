//! Compilation and execution errors

use cohortql_query::{GraphError, ValidationError};
use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The operation has no SQL rendering. Callers wanting it must use the
    /// in-memory engine.
    #[error("{operation} cannot be compiled to SQL")]
    Unsupported { operation: String },

    #[error("graph contains a non-canonical row selection; canonicalize before compiling")]
    NotCanonical,
}

/// Errors raised while executing compiled queries and fetching results.
///
/// Transient errors are worth retrying after a reconnect; everything else is
/// fatal and surfaces immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient database failure: {message}")]
    Transient { message: String },

    #[error("database failure: {message}")]
    Fatal { message: String },

    #[error("row {row} has {found} values, expected {expected}")]
    RowShape { row: usize, expected: usize, found: usize },

    /// Results diverge from the declared column specs.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}
