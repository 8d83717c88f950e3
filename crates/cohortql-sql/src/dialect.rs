//! Dialect seams
//!
//! The compiler emits portable SQL everywhere it can and routes through
//! [`SqlDialect`] where backends genuinely differ: temp table mechanics, date
//! arithmetic, float semantics of AVG, substring tests and the rendering of
//! boolean predicates as selectable values.

use chrono::NaiveDate;

pub trait SqlDialect {
    fn name(&self) -> &'static str;

    /// Name for the `index`-th temporary table of a compilation. `hint` is a
    /// short human-readable tag baked into the name for log legibility.
    fn temp_table_name(&self, index: usize, hint: &str) -> String;

    /// Statements that materialize `select` into the temp table `table`,
    /// including any index worth creating on `patient_id`.
    fn materialize(&self, table: &str, select: &str) -> Vec<String>;

    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {table}")
    }

    /// Render a boolean predicate as a selectable 1/0/NULL value.
    fn predicate_to_value(&self, predicate: &str) -> String;

    fn string_literal(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    fn date_literal(&self, date: NaiveDate) -> String;

    fn mean(&self, expr: &str) -> String;

    fn cast_to_int(&self, expr: &str) -> String;

    fn cast_to_float(&self, expr: &str) -> String;

    fn string_contains(&self, haystack: &str, needle: &str) -> String;

    fn date_add_days(&self, date: &str, days: &str) -> String;

    /// Day overflow must roll forward to the first of the next month, never
    /// clip to month end.
    fn date_add_months(&self, date: &str, months: &str) -> String;

    fn date_add_years(&self, date: &str, years: &str) -> String;

    fn date_difference_in_days(&self, start: &str, end: &str) -> String;

    fn year_from_date(&self, expr: &str) -> String;

    fn month_from_date(&self, expr: &str) -> String;

    fn day_from_date(&self, expr: &str) -> String;

    fn to_first_of_month(&self, expr: &str) -> String;

    fn to_first_of_year(&self, expr: &str) -> String;

    /// Row-wise minimum/maximum across expressions, disregarding nulls.
    /// `func` is `MIN` or `MAX`.
    fn horizontal_aggregate(&self, func: &str, exprs: &[String]) -> String;

    fn max_rows_per_insert(&self) -> usize {
        500
    }
}
