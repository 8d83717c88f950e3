//! Table schemas declared by data providers
//!
//! A schema lists, in declaration order, the non-patient-id columns a table
//! exposes, each with a primitive type and an optional finite category set.
//! Schemas are embedded in `SelectTable` nodes so they must be cheap to clone
//! and structurally hashable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primitive column types understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Str,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Bool => write!(f, "boolean"),
            ColumnType::Int => write!(f, "integer"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Str => write!(f, "string"),
            ColumnType::Date => write!(f, "date"),
        }
    }
}

/// One column in a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub column_type: ColumnType,
    /// Declared category labels for string columns with a closed value set.
    pub categories: Option<Vec<String>>,
}

impl ColumnDef {
    pub fn new(column_type: ColumnType) -> Self {
        Self { column_type, categories: None }
    }

    pub fn with_categories(column_type: ColumnType, categories: Vec<String>) -> Self {
        Self { column_type, categories: Some(categories) }
    }
}

/// An ordered mapping of column name to definition.
///
/// The implicit `patient_id` column is never part of the schema; every table
/// has it and every backend supplies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<(String, ColumnDef)>,
}

impl TableSchema {
    pub fn new(columns: Vec<(String, ColumnDef)>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(|d| d.column_type)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnDef)> {
        self.columns.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
