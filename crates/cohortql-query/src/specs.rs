//! Output column specifications
//!
//! Derived once from the compiled node graph before execution and immutable
//! thereafter; used to validate backend output and to drive serialization.
//! Category information survives the operations that preserve it: selecting a
//! declared categorical column, literal values, min/max aggregation, and case
//! expressions whose every outcome is categorical.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::nodes::{AggregateOp, Dataset, Graph, Node, NodeId};
use crate::schema::ColumnType;
use crate::value::Value;

/// Declared shape of one output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column_type: ColumnType,
    pub nullable: bool,
    pub categories: Option<Vec<String>>,
}

impl ColumnSpec {
    pub fn new(column_type: ColumnType, nullable: bool) -> Self {
        Self { column_type, nullable, categories: None }
    }
}

/// Derive `{column_name: spec}` for a dataset, `patient_id` first.
///
/// Every output except `patient_id` is nullable: even a non-nullable source
/// column becomes nullable once row selection or aggregation can leave a
/// patient without a value.
pub fn column_specs(
    graph: &Graph,
    dataset: &Dataset,
) -> Result<IndexMap<String, ColumnSpec>, ValidationError> {
    let mut specs = IndexMap::new();
    specs.insert("patient_id".to_string(), ColumnSpec::new(ColumnType::Int, false));
    for (name, &node) in &dataset.variables {
        let column_type = graph.series_type(node).ok_or_else(|| {
            ValidationError::UnsupportedColumnType { name: name.clone() }
        })?;
        let mut spec = ColumnSpec::new(column_type, true);
        spec.categories = categories(graph, node);
        specs.insert(name.clone(), spec);
    }
    Ok(specs)
}

/// Category labels of a series, or `None` when any contributing operation
/// destroys category information.
fn categories(graph: &Graph, id: NodeId) -> Option<Vec<String>> {
    match graph.node(id) {
        Node::SelectColumn { source, name } => {
            let (_, schema) = graph.root_table(*source);
            schema.column(name)?.categories.clone()
        }
        Node::Value(Value::Str(s)) => Some(vec![s.clone()]),
        Node::Aggregate { op: AggregateOp::Min | AggregateOp::Max, source } => {
            categories(graph, *source)
        }
        Node::Case { branches, default } => {
            let mut all = Vec::new();
            for &(_, outcome) in branches {
                all.extend(categories(graph, outcome)?);
            }
            if let Some(default) = default {
                all.extend(categories(graph, *default)?);
            }
            // De-duplicate while keeping first-occurrence order.
            let mut seen = std::collections::HashSet::new();
            all.retain(|c| seen.insert(c.clone()));
            Some(all)
        }
        _ => None,
    }
}

/// Check that a result's column names match the spec exactly, before any row
/// is inspected.
pub fn validate_column_names(
    specs: &IndexMap<String, ColumnSpec>,
    actual: &[String],
) -> Result<(), ValidationError> {
    let missing: Vec<String> = specs
        .keys()
        .filter(|name| !actual.contains(name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingColumns { columns: missing });
    }
    let unexpected: Vec<String> = actual
        .iter()
        .filter(|name| !specs.contains_key(*name))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        return Err(ValidationError::UnexpectedColumns { columns: unexpected });
    }
    Ok(())
}

/// Check one cell against its column spec. Formats without an embedded schema
/// can only surface type mismatches here, per value, during iteration.
pub fn validate_value(
    column: &str,
    spec: &ColumnSpec,
    value: &Option<Value>,
) -> Result<(), ValidationError> {
    let Some(value) = value else {
        if spec.nullable {
            return Ok(());
        }
        return Err(ValidationError::UnexpectedNull { column: column.to_string() });
    };
    let found = value.column_type();
    if found != Some(spec.column_type) {
        return Err(ValidationError::TypeMismatch {
            column: column.to_string(),
            expected: spec.column_type.to_string(),
            found: found.map_or_else(|| "set".to_string(), |t| t.to_string()),
        });
    }
    if let (Some(categories), Value::Str(s)) = (&spec.categories, value)
        && !categories.contains(s)
    {
        return Err(ValidationError::CategoryMismatch {
            column: column.to_string(),
            value: s.clone(),
        });
    }
    Ok(())
}
