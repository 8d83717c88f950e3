//! Graph validity and result validation errors

use thiserror::Error;

/// Result type for graph construction.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised while constructing or inspecting a query graph.
///
/// These are all fatal: an invalid graph never reaches a compiler or engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two many-rows-per-patient series were combined without an aggregation.
    #[error("domain mismatch: cannot combine series drawn from {left} with series drawn from {right}")]
    DomainMismatch { left: String, right: String },

    /// An operation received an operand of the wrong cardinality or shape.
    #[error("{operation} requires {expected}, found {found}")]
    CardinalityMismatch {
        operation: String,
        expected: String,
        found: String,
    },

    /// A column reference does not exist in the table's schema.
    #[error("column '{column}' not found in table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// Row selection applied to a frame without an explicit sort.
    #[error("pick_one_row_per_patient requires a sorted frame source")]
    UnsortedSource,

    /// An inline table row does not match the declared schema width.
    #[error("inline table row has {found} values but the schema declares {expected} columns")]
    InlineRowArity { expected: usize, found: usize },

    /// An inline table cell does not match the declared column type.
    #[error("inline table value for column '{column}' has type {found}, expected {expected}")]
    InlineValueType {
        column: String,
        expected: String,
        found: String,
    },

    /// A case expression with no branches.
    #[error("case expression requires at least one branch")]
    EmptyCase,

    /// An n-ary operation with no operands.
    #[error("{operation} requires at least one operand")]
    EmptyOperands { operation: String },

    /// The population definition is not a one-row-per-patient boolean series.
    #[error("population must be a one-row-per-patient boolean series")]
    InvalidPopulation,
}

/// Errors raised while validating result rows against declared column specs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("results are missing columns: {}", columns.join(", "))]
    MissingColumns { columns: Vec<String> },

    #[error("results contain unexpected columns: {}", columns.join(", "))]
    UnexpectedColumns { columns: Vec<String> },

    #[error("column '{column}' has type {found}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("column '{column}' value '{value}' is not in the declared categories")]
    CategoryMismatch { column: String, value: String },

    #[error("column '{column}' is not nullable but contains a null")]
    UnexpectedNull { column: String },

    #[error("output '{name}' has no representable column type")]
    UnsupportedColumnType { name: String },
}
