//! Canonicalization pass behavior, ported scenario by scenario from the
//! row-selection semantics the engines rely on.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;

use cohortql_query::{
    BinaryOp, ColumnDef, ColumnType, Dataset, Graph, Node, NodeId, Position, SortDirection,
    TableSchema, UnaryOp, Value, apply_transforms,
};

fn events_schema() -> TableSchema {
    TableSchema::new(vec![
        ("date".to_string(), ColumnDef::new(ColumnType::Date)),
        ("code".to_string(), ColumnDef::new(ColumnType::Str)),
        ("value".to_string(), ColumnDef::new(ColumnType::Float)),
        ("flag".to_string(), ColumnDef::new(ColumnType::Bool)),
    ])
}

fn dataset(variables: Vec<(&str, NodeId)>, graph: &mut Graph) -> Dataset {
    let population = graph.value(Value::Bool(true));
    Dataset::new(
        population,
        variables
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect::<IndexMap<_, _>>(),
    )
}

fn canonical_pick_of(graph: &Graph, series: NodeId) -> NodeId {
    match graph.node(series) {
        Node::SelectColumn { source, .. } => {
            assert!(matches!(
                graph.node(*source),
                Node::PickOneRowPerPatientWithColumns { .. }
            ));
            *source
        }
        other => panic!("expected a column off a canonical pick, got {other:?}"),
    }
}

#[test]
fn nested_sorts_collapse_into_one_multi_key_pick() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_value = g.select_column(events, "value").unwrap();
    let by_code = g.select_column(events, "code").unwrap();
    let by_date = g.select_column(events, "date").unwrap();
    let s1 = g.sort(events, by_value, SortDirection::Ascending).unwrap();
    let s2 = g.sort(s1, by_code, SortDirection::Ascending).unwrap();
    let s3 = g.sort(s2, by_date, SortDirection::Descending).unwrap();
    let first = g.pick_one_row_per_patient(s3, Position::First).unwrap();
    let first_code = g.select_column(first, "code").unwrap();
    let first_value = g.select_column(first, "value").unwrap();

    let ds = dataset(vec![("first_code", first_code), ("first_value", first_value)], &mut g);
    let out = apply_transforms(&mut g, &ds);

    let pick = canonical_pick_of(&g, out.variables["first_code"]);
    let Node::PickOneRowPerPatientWithColumns { source, sort_keys, selected_columns, position } =
        g.node(pick).clone()
    else {
        panic!()
    };
    assert_eq!(position, Position::First);
    // Sorts compose right to left: the outermost sort is the primary key.
    assert_eq!(
        sort_keys.iter().map(|k| k.key).collect::<Vec<_>>(),
        vec![by_date, by_code, by_value]
    );
    assert_eq!(sort_keys[0].direction, SortDirection::Descending);
    assert_eq!(sort_keys[1].direction, SortDirection::Ascending);
    assert_eq!(source, events);
    assert_eq!(
        selected_columns.into_iter().collect::<Vec<_>>(),
        vec!["code".to_string(), "value".to_string()]
    );
    // Both outputs share the single canonical node.
    assert_eq!(pick, canonical_pick_of(&g, out.variables["first_value"]));
}

#[test]
fn selection_does_not_add_sort_keys() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_date = g.select_column(events, "date").unwrap();
    let sorted = g.sort(events, by_date, SortDirection::Ascending).unwrap();
    let first = g.pick_one_row_per_patient(sorted, Position::First).unwrap();
    // Selecting "code" must not make "code" part of the ordering.
    let first_code = g.select_column(first, "code").unwrap();

    let ds = dataset(vec![("first_code", first_code)], &mut g);
    let out = apply_transforms(&mut g, &ds);

    let pick = canonical_pick_of(&g, out.variables["first_code"]);
    let Node::PickOneRowPerPatientWithColumns { sort_keys, selected_columns, .. } =
        g.node(pick).clone()
    else {
        panic!()
    };
    assert_eq!(sort_keys.iter().map(|k| k.key).collect::<Vec<_>>(), vec![by_date]);
    assert_eq!(selected_columns.into_iter().collect::<Vec<_>>(), vec!["code".to_string()]);
}

#[test]
fn duplicate_keys_keep_the_outermost_occurrence() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_date = g.select_column(events, "date").unwrap();
    let by_code = g.select_column(events, "code").unwrap();
    let s1 = g.sort(events, by_date, SortDirection::Ascending).unwrap();
    let s2 = g.sort(s1, by_code, SortDirection::Ascending).unwrap();
    let s3 = g.sort(s2, by_date, SortDirection::Descending).unwrap();
    let first = g.pick_one_row_per_patient(s3, Position::First).unwrap();
    let v = g.select_column(first, "value").unwrap();

    let ds = dataset(vec![("v", v)], &mut g);
    let out = apply_transforms(&mut g, &ds);

    let pick = canonical_pick_of(&g, out.variables["v"]);
    let Node::PickOneRowPerPatientWithColumns { sort_keys, .. } = g.node(pick).clone() else {
        panic!()
    };
    assert_eq!(
        sort_keys.iter().map(|k| (k.key, k.direction)).collect::<Vec<_>>(),
        vec![
            (by_date, SortDirection::Descending),
            (by_code, SortDirection::Ascending)
        ]
    );
}

#[test]
fn equivalent_sort_chains_collapse_to_one_canonical_node() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_date = g.select_column(events, "date").unwrap();

    let once = g.sort(events, by_date, SortDirection::Ascending).unwrap();
    let twice = g.sort(once, by_date, SortDirection::Ascending).unwrap();
    let pick_a = g.pick_one_row_per_patient(once, Position::First).unwrap();
    let pick_b = g.pick_one_row_per_patient(twice, Position::First).unwrap();
    let code_a = g.select_column(pick_a, "code").unwrap();
    let code_b = g.select_column(pick_b, "code").unwrap();

    let ds = dataset(vec![("a", code_a), ("b", code_b)], &mut g);
    let out = apply_transforms(&mut g, &ds);

    assert_eq!(
        canonical_pick_of(&g, out.variables["a"]),
        canonical_pick_of(&g, out.variables["b"])
    );
}

#[test]
fn copes_with_interleaved_sorts_and_filters() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_code = g.select_column(events, "code").unwrap();
    let inner = g.sort(events, by_code, SortDirection::Ascending).unwrap();
    let cond = g.value(Value::Bool(true));
    let filtered = g.filter(inner, cond).unwrap();
    let by_value = g.select_column(filtered, "value").unwrap();
    let outer = g.sort(filtered, by_value, SortDirection::Ascending).unwrap();
    let first = g.pick_one_row_per_patient(outer, Position::First).unwrap();
    let date = g.select_column(first, "date").unwrap();

    let ds = dataset(vec![("date", date)], &mut g);
    let out = apply_transforms(&mut g, &ds);

    let pick = canonical_pick_of(&g, out.variables["date"]);
    let Node::PickOneRowPerPatientWithColumns { source, sort_keys, .. } = g.node(pick).clone()
    else {
        panic!()
    };
    // The filter survives, rebased onto the sort-free chain.
    let Node::Filter { source: filter_source, .. } = g.node(source).clone() else {
        panic!("expected a filter source, got {:?}", g.node(source))
    };
    assert_eq!(filter_source, events);
    // Keys outer-to-inner, with the inner key rebased onto the stripped filter.
    assert_eq!(sort_keys.len(), 2);
    let Node::SelectColumn { source: key0_src, name: key0_name } =
        g.node(sort_keys[0].key).clone()
    else {
        panic!()
    };
    assert_eq!((key0_src, key0_name.as_str()), (source, "value"));
    assert_eq!(sort_keys[1].key, by_code);
}

#[test]
fn boolean_keys_are_encoded_three_ways() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let flag = g.select_column(events, "flag").unwrap();
    let sorted = g.sort(events, flag, SortDirection::Ascending).unwrap();
    let first = g.pick_one_row_per_patient(sorted, Position::First).unwrap();
    let v = g.select_column(first, "value").unwrap();

    let ds = dataset(vec![("v", v)], &mut g);
    let out = apply_transforms(&mut g, &ds);

    let pick = canonical_pick_of(&g, out.variables["v"]);
    let Node::PickOneRowPerPatientWithColumns { sort_keys, .. } = g.node(pick).clone() else {
        panic!()
    };
    let Node::Case { branches, default } = g.node(sort_keys[0].key).clone() else {
        panic!("boolean key should be encoded through a case expression")
    };
    assert_eq!(branches.len(), 2);
    assert_eq!(branches[0].0, flag);
    assert_eq!(g.node(branches[0].1), &Node::Value(Value::Int(2)));
    assert!(matches!(
        g.node(branches[1].0),
        Node::UnaryOp { op: UnaryOp::Not, .. }
    ));
    assert_eq!(g.node(branches[1].1), &Node::Value(Value::Int(1)));
    assert_eq!(g.node(default.unwrap()), &Node::Value(Value::Int(0)));
}

#[test]
fn transform_is_idempotent() {
    let mut g = Graph::new();
    let events = g.select_table("events", events_schema());
    let by_date = g.select_column(events, "date").unwrap();
    let by_value = g.select_column(events, "value").unwrap();
    let s1 = g.sort(events, by_value, SortDirection::Ascending).unwrap();
    let s2 = g.sort(s1, by_date, SortDirection::Descending).unwrap();
    let first = g.pick_one_row_per_patient(s2, Position::Last).unwrap();
    let code = g.select_column(first, "code").unwrap();
    let count = g.count(events).unwrap();
    let one = g.value(Value::Int(1));
    let seen = g.binary(BinaryOp::Ge, count, one).unwrap();

    let mut vars = IndexMap::new();
    vars.insert("code".to_string(), code);
    let ds = Dataset::new(seen, vars);

    let once = apply_transforms(&mut g, &ds);
    let twice = apply_transforms(&mut g, &once);
    assert_eq!(once.population, twice.population);
    assert_eq!(once.variables, twice.variables);
}
