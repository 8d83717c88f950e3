//! Evaluation errors

use cohortql_query::GraphError;
use thiserror::Error;

pub type EvalResult<T> = Result<T, EvalError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("table '{name}' is not loaded in the in-memory database")]
    UnknownTable { name: String },

    #[error("column '{column}' is missing from in-memory table '{table}'")]
    MissingColumn { table: String, column: String },

    #[error("graph contains a non-canonical row selection; canonicalize before evaluating")]
    NotCanonical,
}
