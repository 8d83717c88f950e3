//! The in-memory engine
//!
//! Evaluates a dataset directly over [`InMemoryDatabase`] tables. The graph is
//! canonicalized first, then each reachable node is evaluated exactly once
//! bottom-up with results memoized by node handle, so shared sub-expressions
//! are computed a single time just as they are in the SQL backends.
//!
//! This engine is the behavioral oracle: its null handling, aggregation
//! defaults and row-selection semantics define what every SQL backend must
//! reproduce.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use cohortql_query::{
    AggregateOp, ColumnType, Dataset, Graph, Node, NodeId, PatientId, Position, SortDirection,
    SortKey, Value, apply_transforms, compare_values,
};

use crate::column::{Column, PatientColumn, RowId, apply};
use crate::error::{EvalError, EvalResult};
use crate::ops;
use crate::table::{EventTable, InMemoryDatabase, PatientTable};

/// One output row: the patient plus the variable values in declaration order.
pub type ResultRow = (PatientId, Vec<Option<Value>>);

pub struct InMemoryEngine<'a> {
    database: &'a InMemoryDatabase,
}

impl<'a> InMemoryEngine<'a> {
    pub fn new(database: &'a InMemoryDatabase) -> Self {
        Self { database }
    }

    /// Evaluate a dataset, returning one row per patient in the population,
    /// ordered by patient id.
    pub fn evaluate(&self, graph: &mut Graph, dataset: &Dataset) -> EvalResult<Vec<ResultRow>> {
        dataset.validate(graph)?;
        let dataset = apply_transforms(graph, dataset);

        let mut universe = self.database.all_patients();
        universe.extend(graph.inline_patient_ids(&dataset.roots()));
        log::debug!(
            "evaluating {} outputs over {} patients",
            dataset.variables.len(),
            universe.len()
        );

        let mut visitor = Visitor {
            graph,
            database: self.database,
            cache: HashMap::new(),
        };
        let population = visitor.patient_column(dataset.population)?;
        let mut variables = Vec::with_capacity(dataset.variables.len());
        for &node in dataset.variables.values() {
            variables.push(visitor.patient_column(node)?);
        }

        let mut rows = Vec::new();
        for patient in universe {
            if population.get(patient) != Some(Value::Bool(true)) {
                continue;
            }
            rows.push((patient, variables.iter().map(|v| v.get(patient)).collect()));
        }
        Ok(rows)
    }
}

#[derive(Debug)]
enum Evaluated {
    Column(Column),
    Events(EventTable),
    Patients(PatientTable),
}

struct Visitor<'g> {
    graph: &'g Graph,
    database: &'g InMemoryDatabase,
    cache: HashMap<NodeId, Rc<Evaluated>>,
}

impl Visitor<'_> {
    fn visit(&mut self, id: NodeId) -> EvalResult<Rc<Evaluated>> {
        if let Some(hit) = self.cache.get(&id) {
            return Ok(Rc::clone(hit));
        }
        let computed = Rc::new(self.compute(id)?);
        self.cache.insert(id, Rc::clone(&computed));
        Ok(computed)
    }

    fn compute(&mut self, id: NodeId) -> EvalResult<Evaluated> {
        let node = self.graph.node(id).clone();
        Ok(match node {
            Node::SelectTable { name, .. } => {
                let table = self
                    .database
                    .event_table(&name)
                    .ok_or(EvalError::UnknownTable { name: name.clone() })?;
                Evaluated::Events(table.clone())
            }
            Node::SelectPatientTable { name, .. } => {
                let table = self
                    .database
                    .patient_table(&name)
                    .ok_or(EvalError::UnknownTable { name: name.clone() })?;
                Evaluated::Patients(table.clone())
            }
            Node::InlineTable { schema, rows } => {
                let names: Vec<String> =
                    schema.column_names().map(str::to_string).collect();
                let rows = rows.into_iter().map(|r| (r.patient_id, r.values)).collect();
                Evaluated::Events(EventTable::from_rows(&names, rows))
            }

            Node::Filter { source, condition } => {
                let table = self.events(source)?;
                let condition = self.column(condition)?;
                Evaluated::Events(table.retain_rows(|patient, row| {
                    condition.cell(patient, row) == Some(Value::Bool(true))
                }))
            }

            // Canonicalization erases these before evaluation.
            Node::Sort { .. } | Node::PickOneRowPerPatient { .. } => {
                return Err(EvalError::NotCanonical);
            }

            Node::PickOneRowPerPatientWithColumns {
                source,
                position,
                sort_keys,
                selected_columns,
            } => {
                let table = self.events(source)?;
                let mut keys = Vec::with_capacity(sort_keys.len());
                for SortKey { key, direction } in sort_keys {
                    keys.push((self.column(key)?, direction));
                }
                Evaluated::Patients(pick_rows(&table, &keys, position, &selected_columns))
            }

            Node::SelectColumn { source, name } => {
                let column = match &*self.visit(source)? {
                    Evaluated::Events(table) => Column::Event(
                        table
                            .column(&name)
                            .ok_or_else(|| self.missing_column(source, &name))?
                            .clone(),
                    ),
                    Evaluated::Patients(table) => Column::Patient(
                        table
                            .column(&name)
                            .ok_or_else(|| self.missing_column(source, &name))?
                            .clone(),
                    ),
                    Evaluated::Column(_) => return Err(EvalError::NotCanonical),
                };
                Evaluated::Column(column)
            }

            Node::Value(v) => {
                Evaluated::Column(Column::Patient(PatientColumn::from_default(Some(v))))
            }

            Node::UnaryOp { op, source } => {
                let source = self.column(source)?;
                Evaluated::Column(apply(&[&source], |args| ops::unary_op(op, &args[0])))
            }
            Node::BinaryOp { op, lhs, rhs } => {
                let lhs = self.column(lhs)?;
                let rhs = self.column(rhs)?;
                Evaluated::Column(apply(&[&lhs, &rhs], |args| {
                    ops::binary_op(op, &args[0], &args[1])
                }))
            }
            Node::NaryOp { op, sources } => {
                let columns: Vec<Column> = sources
                    .iter()
                    .map(|&s| self.column(s))
                    .collect::<EvalResult<_>>()?;
                let refs: Vec<&Column> = columns.iter().collect();
                Evaluated::Column(apply(&refs, |args| ops::nary_op(op, args)))
            }

            Node::Case { branches, default } => {
                // Operands flattened as [cond, outcome, cond, outcome, ..,
                // default?]; the closure walks them pairwise.
                let mut columns = Vec::with_capacity(branches.len() * 2 + 1);
                for &(condition, outcome) in &branches {
                    columns.push(self.column(condition)?);
                    columns.push(self.column(outcome)?);
                }
                if let Some(default) = default {
                    columns.push(self.column(default)?);
                }
                let has_default = default.is_some();
                let branch_count = branches.len();
                let refs: Vec<&Column> = columns.iter().collect();
                Evaluated::Column(apply(&refs, move |args| {
                    for i in 0..branch_count {
                        if args[i * 2] == Some(Value::Bool(true)) {
                            return args[i * 2 + 1].clone();
                        }
                    }
                    if has_default { args[branch_count * 2].clone() } else { None }
                }))
            }

            Node::Exists { source } => {
                Evaluated::Column(Column::Patient(self.events(source)?.exists()))
            }
            Node::Count { source } => {
                Evaluated::Column(Column::Patient(self.events(source)?.count()))
            }
            Node::Aggregate { op, source } => {
                let default = aggregate_default(op, self.graph.series_type(source));
                let column = match self.column(source)? {
                    Column::Event(c) => c,
                    Column::Patient(_) => return Err(EvalError::NotCanonical),
                };
                Evaluated::Column(Column::Patient(
                    column.aggregate(default, |values| ops::aggregate_op(op, values)),
                ))
            }
        })
    }

    fn column(&mut self, id: NodeId) -> EvalResult<Column> {
        match &*self.visit(id)? {
            Evaluated::Column(c) => Ok(c.clone()),
            _ => Err(EvalError::NotCanonical),
        }
    }

    fn patient_column(&mut self, id: NodeId) -> EvalResult<PatientColumn> {
        match self.column(id)? {
            Column::Patient(c) => Ok(c),
            Column::Event(_) => Err(EvalError::NotCanonical),
        }
    }

    fn events(&mut self, id: NodeId) -> EvalResult<EventTable> {
        match &*self.visit(id)? {
            Evaluated::Events(t) => Ok(t.clone()),
            _ => Err(EvalError::NotCanonical),
        }
    }

    fn missing_column(&self, frame: NodeId, column: &str) -> EvalError {
        let (table, _) = self.graph.root_table(frame);
        EvalError::MissingColumn { table: table.to_string(), column: column.to_string() }
    }
}

/// The value an aggregation yields for patients with no rows at all.
fn aggregate_default(op: AggregateOp, source_type: Option<ColumnType>) -> Option<Value> {
    match op {
        AggregateOp::CountDistinct => Some(Value::Int(0)),
        AggregateOp::Sum => match source_type {
            Some(ColumnType::Float) => Some(Value::Float(0.0)),
            _ => Some(Value::Int(0)),
        },
        AggregateOp::CombineAsSet => Some(Value::StrSet(BTreeSet::new())),
        AggregateOp::Min | AggregateOp::Max | AggregateOp::Mean => None,
    }
}

/// Select one row per patient by multi-key sort and build a one-row table of
/// the selected columns. Ties keep input row order, so selection is
/// deterministic for the reference engine.
fn pick_rows(
    table: &EventTable,
    keys: &[(Column, SortDirection)],
    position: Position,
    selected_columns: &BTreeSet<String>,
) -> PatientTable {
    let mut out = PatientTable::default();
    let mut picked: Vec<(PatientId, RowId)> = Vec::new();
    for (&patient, rows) in table.rows() {
        let mut ordered = rows.clone();
        ordered.sort_by(|&a, &b| {
            for (key, direction) in keys {
                let ordering =
                    compare_values(&key.cell(patient, a), &key.cell(patient, b));
                let ordering = match direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        let chosen = match position {
            Position::First => ordered.first(),
            Position::Last => ordered.last(),
        };
        if let Some(&row) = chosen {
            picked.push((patient, row));
        }
    }
    for name in selected_columns {
        let mut column = PatientColumn::from_default(None);
        if let Some(source) = table.column(name) {
            for &(patient, row) in &picked {
                column.insert(patient, source.get(patient, row));
            }
        }
        out.insert_column(name.clone(), column);
    }
    out
}
