//! SQLite execution backend
//!
//! Runs compiled queries over a rusqlite connection: setup statements in
//! order, the results query materialized into one more temp table, rows
//! pulled back through the batched fetcher, and cleanup run unconditionally
//! even when execution fails part-way.
//!
//! Storage conventions: booleans as 0/1 integers, dates as ISO-8601 text,
//! everything else in its natural SQLite affinity.

use chrono::NaiveDate;
use indexmap::IndexMap;
use rusqlite::Connection;

use cohortql_query::{
    ColumnSpec, ColumnType, PatientId, TableSchema, Value, validate_column_names, validate_value,
};

use crate::compiler::CompiledQueries;
use crate::error::FetchError;
use crate::fetch::{BatchSource, Batches, ResultRow, RetryPolicy, fetch_in_batches};

const RESULTS_TABLE: &str = "tmp_results";

pub struct SqliteRunner {
    conn: Connection,
    pub batch_size: usize,
}

impl SqliteRunner {
    pub fn in_memory() -> Result<Self, FetchError> {
        Ok(Self { conn: Connection::open_in_memory()?, batch_size: 1000 })
    }

    pub fn open(path: &str) -> Result<Self, FetchError> {
        Ok(Self { conn: Connection::open(path)?, batch_size: 1000 })
    }

    /// Create a base table for a declared schema. Every table carries the
    /// implicit `patient_id` column.
    pub fn create_table(&self, name: &str, schema: &TableSchema) -> Result<(), FetchError> {
        let mut columns = vec!["patient_id INTEGER NOT NULL".to_string()];
        for (column, def) in schema.columns() {
            columns.push(format!("{column} {}", sqlite_type(def.column_type)));
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE {name} ({});\nCREATE INDEX {name}_patient_id ON {name} (patient_id);",
            columns.join(", ")
        ))?;
        Ok(())
    }

    pub fn insert_rows(
        &self,
        name: &str,
        schema: &TableSchema,
        rows: &[(PatientId, Vec<Option<Value>>)],
    ) -> Result<(), FetchError> {
        let placeholders: Vec<&str> = std::iter::repeat_n("?", schema.len() + 1).collect();
        let mut statement = self.conn.prepare(&format!(
            "INSERT INTO {name} VALUES ({})",
            placeholders.join(", ")
        ))?;
        for (patient, values) in rows {
            if values.len() != schema.len() {
                return Err(FetchError::RowShape {
                    row: 0,
                    expected: schema.len(),
                    found: values.len(),
                });
            }
            let mut params = vec![rusqlite::types::Value::Integer(*patient)];
            for value in values {
                params.push(to_sqlite(value.as_ref()));
            }
            statement.execute(rusqlite::params_from_iter(params))?;
        }
        Ok(())
    }

    /// Execute a compiled dataset end to end and collect every result row.
    pub fn run(
        &self,
        compiled: &CompiledQueries,
        specs: &IndexMap<String, ColumnSpec>,
    ) -> Result<Vec<ResultRow>, FetchError> {
        let result = self.run_inner(compiled, specs);
        // Cleanup is best-effort: the interesting error is the one above.
        for statement in &compiled.cleanup {
            if let Err(error) = self.conn.execute_batch(statement) {
                log::warn!("cleanup statement failed: {error}");
            }
        }
        let _ = self
            .conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {RESULTS_TABLE}"));
        result
    }

    fn run_inner(
        &self,
        compiled: &CompiledQueries,
        specs: &IndexMap<String, ColumnSpec>,
    ) -> Result<Vec<ResultRow>, FetchError> {
        validate_column_names(specs, &compiled.columns)?;
        log::info!("executing {} setup statements", compiled.setup.len());
        for statement in &compiled.setup {
            self.conn.execute_batch(statement)?;
        }
        self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {RESULTS_TABLE};\nCREATE TEMPORARY TABLE {RESULTS_TABLE} AS {}",
            compiled.results
        ))?;
        let variable_specs: Vec<(String, ColumnSpec)> = specs
            .iter()
            .skip(1) // patient_id is the batch key, not a value column
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();
        self.fetch_results(&variable_specs).collect()
    }

    fn fetch_results<'c>(
        &'c self,
        specs: &[(String, ColumnSpec)],
    ) -> Batches<ResultsSource<'c>> {
        fetch_in_batches(
            ResultsSource { conn: &self.conn, specs: specs.to_vec() },
            self.batch_size,
            RetryPolicy::default(),
        )
    }
}

struct ResultsSource<'c> {
    conn: &'c Connection,
    specs: Vec<(String, ColumnSpec)>,
}

impl BatchSource for ResultsSource<'_> {
    fn fetch_batch(
        &mut self,
        after: Option<PatientId>,
        limit: usize,
    ) -> Result<Vec<ResultRow>, FetchError> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT * FROM {RESULTS_TABLE} WHERE patient_id > ? \
             ORDER BY patient_id LIMIT ?"
        ))?;
        let mut rows = statement.query(rusqlite::params![
            after.unwrap_or(i64::MIN),
            limit as i64
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let patient: PatientId = row.get(0)?;
            let mut values = Vec::with_capacity(self.specs.len());
            for (i, (name, spec)) in self.specs.iter().enumerate() {
                let raw: rusqlite::types::Value = row.get(i + 1)?;
                let value = from_sqlite(raw, spec.column_type)?;
                validate_value(name, spec, &value)?;
                values.push(value);
            }
            out.push((patient, values));
        }
        Ok(out)
    }
}

fn sqlite_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Bool | ColumnType::Int => "INTEGER",
        ColumnType::Float => "REAL",
        ColumnType::Str | ColumnType::Date => "TEXT",
    }
}

fn to_sqlite(value: Option<&Value>) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sq;
    match value {
        None => Sq::Null,
        Some(Value::Bool(b)) => Sq::Integer(i64::from(*b)),
        Some(Value::Int(i)) => Sq::Integer(*i),
        Some(Value::Float(f)) => Sq::Real(*f),
        Some(Value::Str(s)) => Sq::Text(s.clone()),
        Some(Value::Date(d)) => Sq::Text(d.format("%Y-%m-%d").to_string()),
        // Sets never live in base tables.
        Some(Value::StrSet(_)) => Sq::Null,
    }
}

fn from_sqlite(
    raw: rusqlite::types::Value,
    column_type: ColumnType,
) -> Result<Option<Value>, FetchError> {
    use rusqlite::types::Value as Sq;
    let value = match (column_type, raw) {
        (_, Sq::Null) => return Ok(None),
        (ColumnType::Bool, Sq::Integer(i)) => Value::Bool(i != 0),
        (ColumnType::Int, Sq::Integer(i)) => Value::Int(i),
        (ColumnType::Float, Sq::Real(f)) => Value::Float(f),
        // Integer-typed SQL expressions can feed float columns.
        (ColumnType::Float, Sq::Integer(i)) => Value::Float(i as f64),
        (ColumnType::Str, Sq::Text(s)) => Value::Str(s),
        (ColumnType::Date, Sq::Text(s)) => {
            let date = NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
                FetchError::Fatal { message: format!("unparseable date '{s}' in results") }
            })?;
            Value::Date(date)
        }
        (expected, found) => {
            return Err(FetchError::Fatal {
                message: format!("result cell {found:?} does not fit a {expected} column"),
            });
        }
    };
    Ok(Some(value))
}
