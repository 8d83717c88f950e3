//! T-SQL dialect
//!
//! Temp tables are session-scoped `#` tables built with `SELECT ... INTO` and
//! given a clustered index on `patient_id`. `DATEADD(month, ..)` clips a day
//! overflow to the end of the shorter month, so month addition carries a
//! one-day correction to roll forward instead; year addition reuses it with
//! the month count scaled. T-SQL cannot select a bare predicate, so boolean
//! predicates become values through a `CASE`.

use chrono::NaiveDate;

use crate::dialect::SqlDialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct MssqlDialect;

impl SqlDialect for MssqlDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn temp_table_name(&self, index: usize, hint: &str) -> String {
        format!("#tmp_{index}_{hint}")
    }

    fn materialize(&self, table: &str, select: &str) -> Vec<String> {
        let index_name = table.trim_start_matches('#');
        vec![
            format!("SELECT * INTO {table} FROM ({select}) AS source_query"),
            format!("CREATE CLUSTERED INDEX ix_{index_name} ON {table} (patient_id)"),
        ]
    }

    fn predicate_to_value(&self, predicate: &str) -> String {
        format!("CASE WHEN {predicate} THEN 1 WHEN NOT ({predicate}) THEN 0 ELSE NULL END")
    }

    fn date_literal(&self, date: NaiveDate) -> String {
        format!("CAST('{}' AS DATE)", date.format("%Y-%m-%d"))
    }

    fn mean(&self, expr: &str) -> String {
        // AVG over integers is integer division in T-SQL.
        format!("AVG(CAST({expr} AS FLOAT))")
    }

    fn cast_to_int(&self, expr: &str) -> String {
        format!("CAST({expr} AS BIGINT)")
    }

    fn cast_to_float(&self, expr: &str) -> String {
        format!("CAST({expr} AS FLOAT)")
    }

    fn string_contains(&self, haystack: &str, needle: &str) -> String {
        format!("CHARINDEX({needle}, {haystack}) > 0")
    }

    fn date_add_days(&self, date: &str, days: &str) -> String {
        format!("DATEADD(day, {days}, {date})")
    }

    fn date_add_months(&self, date: &str, months: &str) -> String {
        // DATEADD clips 2020-01-31 + 1 month to 2020-02-29; a clipped result
        // is detectable as a smaller day-of-month, and one extra day lands it
        // on the first of the next month.
        let shifted = format!("DATEADD(month, {months}, {date})");
        format!(
            "CASE WHEN DAY({shifted}) < DAY({date}) \
             THEN DATEADD(day, 1, {shifted}) \
             ELSE {shifted} END"
        )
    }

    fn date_add_years(&self, date: &str, years: &str) -> String {
        self.date_add_months(date, &format!("({years}) * 12"))
    }

    fn date_difference_in_days(&self, start: &str, end: &str) -> String {
        format!("DATEDIFF(day, {start}, {end})")
    }

    fn year_from_date(&self, expr: &str) -> String {
        format!("YEAR({expr})")
    }

    fn month_from_date(&self, expr: &str) -> String {
        format!("MONTH({expr})")
    }

    fn day_from_date(&self, expr: &str) -> String {
        format!("DAY({expr})")
    }

    fn to_first_of_month(&self, expr: &str) -> String {
        format!("DATEFROMPARTS(YEAR({expr}), MONTH({expr}), 1)")
    }

    fn to_first_of_year(&self, expr: &str) -> String {
        format!("DATEFROMPARTS(YEAR({expr}), 1, 1)")
    }

    fn horizontal_aggregate(&self, func: &str, exprs: &[String]) -> String {
        let rows: Vec<String> = exprs.iter().map(|e| format!("({e})")).collect();
        format!(
            "(SELECT {func}(v) FROM (VALUES {}) AS horizontal(v))",
            rows.join(", ")
        )
    }

    // T-SQL caps the number of rows in a single VALUES clause.
    fn max_rows_per_insert(&self) -> usize {
        999
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_tables_are_session_hash_tables() {
        let d = MssqlDialect;
        assert_eq!(d.temp_table_name(3, "agg"), "#tmp_3_agg");
        let stmts = d.materialize("#tmp_3_agg", "SELECT 1 AS patient_id");
        assert!(stmts[0].starts_with("SELECT * INTO #tmp_3_agg"));
        assert!(stmts[1].contains("CLUSTERED INDEX"));
    }

    #[test]
    fn predicates_become_three_way_case_values() {
        let d = MssqlDialect;
        assert_eq!(
            d.predicate_to_value("a > b"),
            "CASE WHEN a > b THEN 1 WHEN NOT (a > b) THEN 0 ELSE NULL END"
        );
    }

    #[test]
    fn year_addition_scales_through_month_addition() {
        let d = MssqlDialect;
        let sql = d.date_add_years("t.d", "2");
        assert!(sql.contains("DATEADD(month, (2) * 12, t.d)"));
    }
}
