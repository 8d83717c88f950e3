//! SQLite dialect
//!
//! Dates travel as ISO-8601 text and all date arithmetic goes through the
//! `DATE`/`julianday`/`strftime` builtins. SQLite normalizes impossible dates
//! like `2020-02-31` by rolling them into the next month, which is almost the
//! calendar rule we want: only the day-of-month correction for month addition
//! needs an explicit `CASE`.

use chrono::NaiveDate;

use crate::dialect::SqlDialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn temp_table_name(&self, index: usize, hint: &str) -> String {
        format!("tmp_{index}_{hint}")
    }

    fn materialize(&self, table: &str, select: &str) -> Vec<String> {
        vec![
            format!("CREATE TEMPORARY TABLE {table} AS {select}"),
            format!("CREATE INDEX {table}_patient_id ON {table} (patient_id)"),
        ]
    }

    // SQLite lets a bare predicate be selected as 0/1/NULL directly.
    fn predicate_to_value(&self, predicate: &str) -> String {
        format!("({predicate})")
    }

    fn date_literal(&self, date: NaiveDate) -> String {
        format!("'{}'", date.format("%Y-%m-%d"))
    }

    fn mean(&self, expr: &str) -> String {
        format!("AVG({expr})")
    }

    fn cast_to_int(&self, expr: &str) -> String {
        format!("CAST({expr} AS INTEGER)")
    }

    fn cast_to_float(&self, expr: &str) -> String {
        format!("CAST({expr} AS REAL)")
    }

    fn string_contains(&self, haystack: &str, needle: &str) -> String {
        format!("INSTR({haystack}, {needle}) > 0")
    }

    fn date_add_days(&self, date: &str, days: &str) -> String {
        format!("DATE({date}, ({days}) || ' days')")
    }

    fn date_add_months(&self, date: &str, months: &str) -> String {
        // Normalization rolls 2020-02-31 to 2020-03-02; when the day slipped,
        // snap back to the first of that month.
        let shifted = format!("DATE({date}, ({months}) || ' months')");
        format!(
            "CASE WHEN CAST(strftime('%d', {shifted}) AS INTEGER) < \
             CAST(strftime('%d', {date}) AS INTEGER) \
             THEN DATE({date}, ({months}) || ' months', 'start of month') \
             ELSE {shifted} END"
        )
    }

    fn date_add_years(&self, date: &str, years: &str) -> String {
        // 29 Feb normalizes to 1 Mar, which is already the rule.
        format!("DATE({date}, ({years}) || ' years')")
    }

    fn date_difference_in_days(&self, start: &str, end: &str) -> String {
        format!("CAST(julianday({end}) - julianday({start}) AS INTEGER)")
    }

    fn year_from_date(&self, expr: &str) -> String {
        format!("CAST(strftime('%Y', {expr}) AS INTEGER)")
    }

    fn month_from_date(&self, expr: &str) -> String {
        format!("CAST(strftime('%m', {expr}) AS INTEGER)")
    }

    fn day_from_date(&self, expr: &str) -> String {
        format!("CAST(strftime('%d', {expr}) AS INTEGER)")
    }

    fn to_first_of_month(&self, expr: &str) -> String {
        format!("DATE({expr}, 'start of month')")
    }

    fn to_first_of_year(&self, expr: &str) -> String {
        format!("DATE({expr}, 'start of year')")
    }

    fn horizontal_aggregate(&self, func: &str, exprs: &[String]) -> String {
        let rows: Vec<String> = exprs.iter().map(|e| format!("({e})")).collect();
        format!("(SELECT {func}(column1) FROM (VALUES {}))", rows.join(", "))
    }
}
