//! End-to-end evaluation scenarios against the in-memory engine.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;

use chrono::NaiveDate;
use cohortql_query::{
    AggregateOp, BinaryOp, ColumnDef, ColumnType, Dataset, Graph, InlineRow, NodeId, Position,
    SortDirection, TableSchema, UnaryOp, Value,
};
use cohortql_eval::{InMemoryDatabase, InMemoryEngine};

fn events_schema() -> TableSchema {
    TableSchema::new(vec![
        ("date".to_string(), ColumnDef::new(ColumnType::Date)),
        ("code".to_string(), ColumnDef::new(ColumnType::Str)),
        ("value".to_string(), ColumnDef::new(ColumnType::Float)),
    ])
}

fn patients_schema() -> TableSchema {
    TableSchema::new(vec![(
        "date_of_birth".to_string(),
        ColumnDef::new(ColumnType::Date),
    )])
}

fn date(y: i32, m: u32, d: u32) -> Option<Value> {
    Some(Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap()))
}

fn code(c: &str) -> Option<Value> {
    Some(Value::Str(c.to_string()))
}

fn float(f: f64) -> Option<Value> {
    Some(Value::Float(f))
}

fn int(i: i64) -> Option<Value> {
    Some(Value::Int(i))
}

fn dataset(population: NodeId, variables: Vec<(&str, NodeId)>) -> Dataset {
    Dataset::new(
        population,
        variables
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect::<IndexMap<_, _>>(),
    )
}

fn clinical_database() -> InMemoryDatabase {
    let mut db = InMemoryDatabase::new();
    db.add_patient_table(
        "patients",
        &["date_of_birth"],
        vec![
            (1, vec![date(1980, 3, 15)]),
            (2, vec![date(1990, 7, 1)]),
            (3, vec![date(2001, 12, 30)]),
        ],
    );
    db.add_event_table(
        "events",
        &["date", "code", "value"],
        vec![
            (1, vec![date(2021, 1, 10), code("abc"), float(1.5)]),
            (1, vec![date(2021, 6, 5), code("def"), float(2.5)]),
            (1, vec![date(2020, 2, 1), code("abc"), None]),
            (2, vec![date(2022, 3, 3), code("ghi"), float(7.0)]),
        ],
    );
    db
}

#[test]
fn count_first_code_and_mean_value_per_patient() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_date = g.select_column(events, "date").unwrap();
    let sorted = g.sort(events, by_date, SortDirection::Ascending).unwrap();
    let first = g.pick_one_row_per_patient(sorted, Position::First).unwrap();
    let first_code = g.select_column(first, "code").unwrap();
    let value = g.select_column(events, "value").unwrap();
    let mean_value = g.aggregate(AggregateOp::Mean, value).unwrap();
    let count = g.count(events).unwrap();
    let pop = g.value(Value::Bool(true));

    let ds = dataset(
        pop,
        vec![("n", count), ("first_code", first_code), ("mean_value", mean_value)],
    );
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();

    assert_eq!(
        rows,
        vec![
            (1, vec![int(3), code("abc"), float(2.0)]),
            (2, vec![int(1), code("ghi"), float(7.0)]),
            // Patient 3 has no events: count 0, no first row, no mean.
            (3, vec![int(0), None, None]),
        ]
    );
}

#[test]
fn filtering_by_codelist_membership() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let event_code = g.select_column(events, "code").unwrap();
    let codelist = g.value(Value::StrSet(
        ["abc".to_string(), "ghi".to_string()].into(),
    ));
    let matches = g.binary(BinaryOp::In, event_code, codelist).unwrap();
    let filtered = g.filter(events, matches).unwrap();
    let matching = g.count(filtered).unwrap();
    let pop = g.value(Value::Bool(true));

    let ds = dataset(pop, vec![("matching", matching)]);
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    assert_eq!(
        rows,
        vec![(1, vec![int(2)]), (2, vec![int(1)]), (3, vec![int(0)])]
    );
}

#[test]
fn case_skips_null_conditions_and_defaults_to_null() {
    // value > 2.0 is null for the event with a null value; a null condition
    // must be skipped rather than treated as a match.
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let value = g.select_column(events, "value").unwrap();
    let max = g.aggregate(AggregateOp::Max, value).unwrap();
    let threshold = g.value(Value::Float(2.0));
    let high = g.binary(BinaryOp::Gt, max, threshold).unwrap();
    let label_high = g.value(Value::Str("high".to_string()));
    let cased = g.case(vec![(high, label_high)], None).unwrap();
    let pop = g.value(Value::Bool(true));

    let ds = dataset(pop, vec![("band", cased)]);
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    assert_eq!(
        rows,
        vec![
            (1, vec![code("high")]),
            (2, vec![code("high")]),
            // Patient 3's max is null, so the condition is null: no match,
            // no default, null out.
            (3, vec![None]),
        ]
    );
}

#[test]
fn last_row_selection_reverses_null_placement() {
    // Nulls sort first ascending, so picking the last row prefers non-null
    // values while picking the first prefers nulls.
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let value = g.select_column(events, "value").unwrap();
    let sorted = g.sort(events, value, SortDirection::Ascending).unwrap();
    let first = g.pick_one_row_per_patient(sorted, Position::First).unwrap();
    let last = g.pick_one_row_per_patient(sorted, Position::Last).unwrap();
    let first_value = g.select_column(first, "value").unwrap();
    let last_value = g.select_column(last, "value").unwrap();
    let pop = g.exists(events).unwrap();

    let ds = dataset(pop, vec![("first", first_value), ("last", last_value)]);
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    assert_eq!(
        rows,
        vec![
            (1, vec![None, float(2.5)]),
            (2, vec![float(7.0), float(7.0)]),
        ]
    );
}

#[test]
fn age_computation_through_date_arithmetic() {
    let mut g = Graph::new();
    let patients = g.select_patient_table("patients", patients_schema());
    let dob = g.select_column(patients, "date_of_birth").unwrap();
    let at = g.value(Value::Date(NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()));
    let age = g.binary(BinaryOp::DateDifferenceInYears, dob, at).unwrap();
    let pop = g.value(Value::Bool(true));

    let ds = dataset(pop, vec![("age", age)]);
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    assert_eq!(
        rows,
        vec![(1, vec![int(40)]), (2, vec![int(30)]), (3, vec![int(19)])]
    );
}

#[test]
fn inline_tables_extend_the_patient_universe() {
    let mut g = Graph::new();
    let schema = TableSchema::new(vec![("n".to_string(), ColumnDef::new(ColumnType::Int))]);
    let inline = g
        .inline_table(
            schema,
            vec![
                InlineRow { patient_id: 3, values: vec![int(10)] },
                // Patient 99 exists in no backend table.
                InlineRow { patient_id: 99, values: vec![int(20)] },
            ],
        )
        .unwrap();
    let n = g.select_column(inline, "n").unwrap();
    let total = g.aggregate(AggregateOp::Sum, n).unwrap();
    let pop = g.exists(inline).unwrap();

    let ds = dataset(pop, vec![("total", total)]);
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    assert_eq!(rows, vec![(3, vec![int(10)]), (99, vec![int(20)])]);
}

#[test]
fn boolean_sort_keys_order_true_false_null() {
    let mut g = Graph::new();
    let schema = TableSchema::new(vec![
        ("flag".to_string(), ColumnDef::new(ColumnType::Bool)),
        ("tag".to_string(), ColumnDef::new(ColumnType::Str)),
    ]);
    let t = g.select_table("flags", schema);
    let flag = g.select_column(t, "flag").unwrap();
    let sorted = g.sort(t, flag, SortDirection::Descending).unwrap();
    let top = g.pick_one_row_per_patient(sorted, Position::First).unwrap();
    let tag = g.select_column(top, "tag").unwrap();
    let pop = g.exists(t).unwrap();

    let ds = dataset(pop, vec![("tag", tag)]);
    let mut db = InMemoryDatabase::new();
    db.add_event_table(
        "flags",
        &["flag", "tag"],
        vec![
            (1, vec![None, code("null")]),
            (1, vec![Some(Value::Bool(false)), code("false")]),
            (1, vec![Some(Value::Bool(true)), code("true")]),
        ],
    );
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    // Descending on the encoded key puts true first.
    assert_eq!(rows, vec![(1, vec![code("true")])]);
}

#[test]
fn not_and_is_null_compose_over_aggregates() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let value = g.select_column(events, "value").unwrap();
    let mean = g.aggregate(AggregateOp::Mean, value).unwrap();
    let missing = g.unary(UnaryOp::IsNull, mean).unwrap();
    let present = g.unary(UnaryOp::Not, missing).unwrap();
    let pop = g.value(Value::Bool(true));

    let ds = dataset(pop, vec![("has_mean", present)]);
    let db = clinical_database();
    let rows = InMemoryEngine::new(&db).evaluate(&mut g, &ds).unwrap();
    assert_eq!(
        rows,
        vec![
            (1, vec![Some(Value::Bool(true))]),
            (2, vec![Some(Value::Bool(true))]),
            (3, vec![Some(Value::Bool(false))]),
        ]
    );
}
