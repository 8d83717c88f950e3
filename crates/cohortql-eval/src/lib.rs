//! cohortql in-memory reference engine
//!
//! Executes a [`cohortql_query::Dataset`] directly over columnar in-memory
//! tables, with the same three-valued logic, aggregation defaults and
//! row-selection semantics the SQL backends must reproduce. Small enough to
//! read end to end, which is the point: when a SQL backend and this engine
//! disagree, this engine is the one that defines correct.

pub mod column;
pub mod dates;
pub mod engine;
pub mod error;
pub mod ops;
pub mod table;

pub use column::{Column, EventColumn, PatientColumn, RowId};
pub use engine::{InMemoryEngine, ResultRow};
pub use error::{EvalError, EvalResult};
pub use table::{EventTable, InMemoryDatabase, PatientTable};
