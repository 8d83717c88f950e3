//! SQL backend for cohort queries
//!
//! Turns a canonical query graph into a dialect-specific query plan: temp
//! tables for per-patient aggregates, row picks, inline data and large value
//! sets, then one results query over the patient universe. [`SqlDialect`]
//! isolates the syntax that differs between engines; [`SqliteDialect`] and
//! [`MssqlDialect`] cover the two supported backends. [`SqliteRunner`]
//! executes a compiled plan over rusqlite and streams the rows back through
//! the batched fetcher in [`fetch`].

pub mod compiler;
pub mod dialect;
pub mod error;
pub mod fetch;
pub mod mssql;
pub mod runner;
pub mod sqlite;

pub use compiler::{CompiledQueries, CompilerConfig, compile};
pub use dialect::SqlDialect;
pub use error::{CompileError, CompileResult, FetchError};
pub use fetch::{BatchSource, Batches, ResultRow, RetryPolicy, fetch_in_batches};
pub use mssql::MssqlDialect;
pub use runner::SqliteRunner;
pub use sqlite::SqliteDialect;
