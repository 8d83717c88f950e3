//! cohortql query model
//!
//! The intermediate representation shared by every execution backend: an interned
//! graph of relational operations over per-patient record tables, the validity
//! rules that make a graph well-formed, the canonicalizing transform pass, and
//! the output column specifications derived from a compiled graph.
//!
//! A query is a [`Dataset`]: a distinguished boolean `population` series plus an
//! ordered mapping of output names to one-row-per-patient series. Nodes are
//! built through the [`Graph`] arena, which validates cardinality and domain
//! compatibility at construction time and interns structurally equal nodes so
//! the graph is a DAG with genuine sharing.

pub mod error;
pub mod nodes;
pub mod schema;
pub mod specs;
pub mod transforms;
pub mod value;

pub use error::{GraphError, GraphResult, ValidationError};
pub use nodes::{
    AggregateOp, BinaryOp, Cardinality, Dataset, Domain, Graph, InlineRow, NaryOp, Node, NodeId,
    Position, SortDirection, SortKey, UnaryOp,
};
pub use schema::{ColumnDef, ColumnType, TableSchema};
pub use specs::{ColumnSpec, column_specs, validate_column_names, validate_value};
pub use transforms::apply_transforms;
pub use value::{PatientId, Value, compare_present, compare_values};
