//! Per-patient cohort queries for Rust
//!
//! A query is a graph of relational operations over per-patient record
//! tables, reduced to one row per patient and executed either by the
//! in-memory reference engine or by compiling to SQL:
//! - building and validating query graphs ([`query`])
//! - the in-memory reference engine ([`eval`])
//! - SQL compilation, dialects and batched fetching ([`sql`])
//!
//! # Example
//!
//! ```ignore
//! use cohortql::{Dataset, Graph, InMemoryDatabase, InMemoryEngine};
//! use indexmap::IndexMap;
//!
//! let mut graph = Graph::new();
//! let events = graph.select_table("events", events_schema());
//! let n = graph.count(events)?;
//! let population = graph.exists(events)?;
//! let dataset = Dataset::new(population, IndexMap::from([("n".to_string(), n)]));
//!
//! let rows = InMemoryEngine::new(&database).evaluate(&mut graph, &dataset)?;
//! ```

// Re-export the internal crates under short module names
pub use cohortql_eval as eval;
pub use cohortql_query as query;
pub use cohortql_sql as sql;

// Convenience re-exports
pub use cohortql_eval::{InMemoryDatabase, InMemoryEngine};
pub use cohortql_query::{
    ColumnSpec, Dataset, Graph, GraphError, PatientId, Value, column_specs,
};
pub use cohortql_sql::{
    CompilerConfig, MssqlDialect, SqlDialect, SqliteDialect, SqliteRunner, compile,
    fetch_in_batches,
};
