//! Graph-to-SQL compiler
//!
//! Compilation walks the canonical graph in dependency order and lowers every
//! one-row-per-patient "atom" into a temporary table keyed by `patient_id`:
//!
//! * aggregations (`Exists`, `Count`, `Aggregate`) over one domain are batched
//!   into a single `GROUP BY patient_id` table per domain, split only when a
//!   later aggregation depends on an earlier one;
//! * each canonical row selection becomes a `ROW_NUMBER()` window query
//!   materialized with the columns actually selected off the picked row;
//! * inline tables and oversized value sets are materialized as literal
//!   tables.
//!
//! The results query left-joins the atom tables onto a patient universe table
//! built from every referenced base table, applies aggregation defaults with
//! `COALESCE`, and filters by the population predicate. The output is a plain
//! list of statements: setup, one results query, cleanup.

use std::collections::{BTreeSet, HashMap, HashSet};

use cohortql_query::{
    AggregateOp, BinaryOp, Dataset, Domain, Graph, NaryOp, Node, NodeId, Position, SortDirection,
    UnaryOp, Value, apply_transforms,
};

use crate::dialect::SqlDialect;
use crate::error::{CompileError, CompileResult};

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Value sets up to this size compile to literal `IN` lists; larger ones
    /// are materialized as temporary tables.
    pub inline_set_max: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self { inline_set_max: 16 }
    }
}

/// Everything a backend needs to execute one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQueries {
    pub setup: Vec<String>,
    pub results: String,
    /// Safe to run even after a partial setup.
    pub cleanup: Vec<String>,
    /// Output column names, `patient_id` first.
    pub columns: Vec<String>,
}

pub fn compile(
    graph: &mut Graph,
    dataset: &Dataset,
    dialect: &dyn SqlDialect,
    config: &CompilerConfig,
) -> CompileResult<CompiledQueries> {
    dataset.validate(graph)?;
    let dataset = apply_transforms(graph, dataset);
    let mut compiler = Compiler {
        graph,
        dialect,
        config,
        setup: Vec::new(),
        cleanup: Vec::new(),
        temp_count: 0,
        atoms: HashMap::new(),
        picks: HashMap::new(),
        inline_tables: HashMap::new(),
        value_sets: HashMap::new(),
        pending: Vec::new(),
    };
    compiler.run(&dataset)
}

/// How a patient-level atom is read back out of its temp table.
#[derive(Debug, Clone)]
struct AtomRef {
    table: String,
    column: String,
    kind: AtomKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AtomKind {
    /// Row presence is the value: `table.patient_id IS NOT NULL`.
    Presence,
    /// Patients with no rows read as zero; the aggregate itself is never null.
    ZeroDefault,
    /// Patients with no rows read as zero, but a null aggregate over existing
    /// rows stays null. `COALESCE` cannot tell those apart.
    ZeroWhenAbsent,
    /// Patients with no rows read as null.
    Plain,
}

struct PendingGroup {
    frame: NodeId,
    atoms: Vec<NodeId>,
}

/// A compiled expression: either a boolean predicate, usable directly in
/// `WHERE`/`CASE WHEN` with SQL's native three-valued logic, or a value.
enum Fragment {
    Value(String),
    Predicate(String),
}

struct Sql {
    fragment: Fragment,
    joins: BTreeSet<String>,
}

impl Sql {
    fn value(sql: String) -> Self {
        Self { fragment: Fragment::Value(sql), joins: BTreeSet::new() }
    }

    fn predicate(sql: String) -> Self {
        Self { fragment: Fragment::Predicate(sql), joins: BTreeSet::new() }
    }

    fn with_joins(mut self, joins: BTreeSet<String>) -> Self {
        self.joins.extend(joins);
        self
    }

    fn as_value(&self, dialect: &dyn SqlDialect) -> String {
        match &self.fragment {
            Fragment::Value(v) => v.clone(),
            Fragment::Predicate(p) => dialect.predicate_to_value(p),
        }
    }

    fn as_predicate(&self) -> String {
        match &self.fragment {
            Fragment::Value(v) => format!("({v}) = 1"),
            Fragment::Predicate(p) => p.clone(),
        }
    }
}

struct Compiler<'a> {
    graph: &'a Graph,
    dialect: &'a dyn SqlDialect,
    config: &'a CompilerConfig,
    setup: Vec<String>,
    cleanup: Vec<String>,
    temp_count: usize,
    atoms: HashMap<NodeId, AtomRef>,
    picks: HashMap<NodeId, String>,
    inline_tables: HashMap<NodeId, String>,
    value_sets: HashMap<NodeId, String>,
    pending: Vec<PendingGroup>,
}

impl Compiler<'_> {
    fn run(&mut self, dataset: &Dataset) -> CompileResult<CompiledQueries> {
        let roots = dataset.roots();
        for id in self.graph.walk(&roots) {
            match self.graph.node(id) {
                Node::InlineTable { .. } => self.materialize_inline(id)?,
                Node::Exists { .. } | Node::Count { .. } | Node::Aggregate { .. } => {
                    self.enqueue_atom(id)?;
                }
                Node::PickOneRowPerPatientWithColumns { .. } => {
                    self.flush_deps_of(id)?;
                    self.build_pick(id)?;
                }
                Node::Sort { .. } | Node::PickOneRowPerPatient { .. } => {
                    return Err(CompileError::NotCanonical);
                }
                _ => {}
            }
        }
        self.flush_all()?;

        let universe = self.build_universe(&roots)?;
        let population = self.expr(dataset.population, None)?;
        let mut joins = population.joins.clone();
        let mut selects = vec!["p.patient_id AS patient_id".to_string()];
        let mut columns = vec!["patient_id".to_string()];
        for (name, &node) in &dataset.variables {
            let compiled = self.expr(node, None)?;
            selects.push(format!("{} AS {name}", compiled.as_value(self.dialect)));
            joins.extend(compiled.joins);
            columns.push(name.clone());
        }
        let results = format!(
            "SELECT {}\nFROM {universe} AS p{}\nWHERE {}",
            selects.join(", "),
            render_joins(&joins, "p"),
            population.as_predicate(),
        );
        log::debug!(
            "compiled {} setup statements and {} output columns for {}",
            self.setup.len(),
            columns.len(),
            self.dialect.name()
        );
        Ok(CompiledQueries {
            setup: std::mem::take(&mut self.setup),
            results,
            cleanup: std::mem::take(&mut self.cleanup),
            columns,
        })
    }

    //
    // Temp table plumbing
    //

    fn temp_table(&mut self, hint: &str, select: &str) -> String {
        let name = self.dialect.temp_table_name(self.temp_count, hint);
        self.temp_count += 1;
        // Cleanup runs unconditionally, so guard against a setup that never
        // reached this table.
        self.cleanup.insert(0, self.dialect.drop_table(&name));
        self.setup.extend(self.dialect.materialize(&name, select));
        name
    }

    fn materialize_inline(&mut self, id: NodeId) -> CompileResult<()> {
        let Node::InlineTable { schema, rows } = self.graph.node(id) else {
            unreachable!()
        };
        let mut names = vec!["patient_id".to_string()];
        names.extend(schema.column_names().map(str::to_string));
        let mut literal_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = vec![row.patient_id.to_string()];
            for value in &row.values {
                cells.push(self.literal(value.as_ref())?);
            }
            literal_rows.push(cells);
        }
        let table = self.literal_table("inline", &names, &literal_rows);
        self.inline_tables.insert(id, table);
        Ok(())
    }

    fn ensure_value_set(&mut self, id: NodeId, values: &BTreeSet<String>) -> String {
        if let Some(table) = self.value_sets.get(&id) {
            return table.clone();
        }
        let rows: Vec<Vec<String>> = values
            .iter()
            .map(|v| vec![self.dialect.string_literal(v)])
            .collect();
        let table = self.literal_table("values", &["value".to_string()], &rows);
        self.value_sets.insert(id, table.clone());
        table
    }

    /// Materialize literal rows: the first chunk seeds the table through a
    /// UNION ALL select, the rest arrive as batched inserts.
    fn literal_table(&mut self, hint: &str, columns: &[String], rows: &[Vec<String>]) -> String {
        let chunk_size = self.dialect.max_rows_per_insert();
        let header: Vec<String> = columns.iter().map(|c| format!("NULL AS {c}")).collect();
        let seed = if rows.is_empty() {
            format!("SELECT {} WHERE 0 = 1", header.join(", "))
        } else {
            rows[..rows.len().min(chunk_size)]
                .iter()
                .map(|row| {
                    let cells: Vec<String> = row
                        .iter()
                        .zip(columns)
                        .map(|(v, c)| format!("{v} AS {c}"))
                        .collect();
                    format!("SELECT {}", cells.join(", "))
                })
                .collect::<Vec<_>>()
                .join(" UNION ALL ")
        };
        let table = self.temp_table(hint, &seed);
        for chunk in rows.chunks(chunk_size).skip(1) {
            let values: Vec<String> = chunk.iter().map(|row| format!("({})", row.join(", "))).collect();
            self.setup.push(format!(
                "INSERT INTO {table} ({}) VALUES {}",
                columns.join(", "),
                values.join(", ")
            ));
        }
        table
    }

    //
    // Atoms
    //

    fn enqueue_atom(&mut self, id: NodeId) -> CompileResult<()> {
        if let Node::Aggregate { op: AggregateOp::CombineAsSet, .. } = self.graph.node(id) {
            return Err(CompileError::Unsupported {
                operation: "combine-as-set aggregation".to_string(),
            });
        }
        self.flush_deps_of(id)?;
        let frame = self.atom_frame(id);
        match self.pending.iter_mut().find(|g| g.frame == frame) {
            Some(group) => group.atoms.push(id),
            None => self.pending.push(PendingGroup { frame, atoms: vec![id] }),
        }
        Ok(())
    }

    fn atom_frame(&self, id: NodeId) -> NodeId {
        match self.graph.node(id) {
            Node::Exists { source } | Node::Count { source } => *source,
            Node::Aggregate { source, .. } => match self.graph.domain(*source) {
                Domain::Events(frame) => frame,
                // Aggregation sources are validated many-rows.
                Domain::Patient => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    /// Flush any pending group containing an atom the given node depends on,
    /// so its temp table exists before the dependent query is rendered.
    fn flush_deps_of(&mut self, id: NodeId) -> CompileResult<()> {
        let deps: HashSet<NodeId> =
            self.graph.walk(&self.graph.operands(id)).into_iter().collect();
        loop {
            let Some(pos) = self
                .pending
                .iter()
                .position(|g| g.atoms.iter().any(|a| deps.contains(a)))
            else {
                break;
            };
            let group = self.pending.remove(pos);
            self.flush_group(group)?;
        }
        Ok(())
    }

    fn flush_all(&mut self) -> CompileResult<()> {
        while !self.pending.is_empty() {
            let group = self.pending.remove(0);
            self.flush_group(group)?;
        }
        Ok(())
    }

    fn flush_group(&mut self, group: PendingGroup) -> CompileResult<()> {
        let (from_table, conditions, mut joins) = self.frame_query_parts(group.frame)?;
        let mut selects = vec!["t.patient_id AS patient_id".to_string()];
        let mut refs = Vec::new();
        for (index, &atom) in group.atoms.iter().enumerate() {
            let column = format!("c{index}");
            let (sql, kind) = match self.graph.node(atom) {
                Node::Exists { .. } => (None, AtomKind::Presence),
                Node::Count { .. } => (Some("COUNT(*)".to_string()), AtomKind::ZeroDefault),
                Node::Aggregate { op, source } => {
                    let source = self.expr(*source, Some("t"))?;
                    let value = source.as_value(self.dialect);
                    joins.extend(source.joins);
                    let (sql, kind) = match op {
                        AggregateOp::CountDistinct => {
                            (format!("COUNT(DISTINCT {value})"), AtomKind::ZeroDefault)
                        }
                        AggregateOp::Min => (format!("MIN({value})"), AtomKind::Plain),
                        AggregateOp::Max => (format!("MAX({value})"), AtomKind::Plain),
                        AggregateOp::Sum => (format!("SUM({value})"), AtomKind::ZeroWhenAbsent),
                        AggregateOp::Mean => (self.dialect.mean(&value), AtomKind::Plain),
                        AggregateOp::CombineAsSet => unreachable!(),
                    };
                    (Some(sql), kind)
                }
                _ => unreachable!(),
            };
            if let Some(sql) = sql {
                selects.push(format!("{sql} AS {column}"));
            }
            refs.push((atom, column, kind));
        }
        let select = render_event_query(&selects, &from_table, &joins, &conditions)
            + "\nGROUP BY t.patient_id";
        let table = self.temp_table("agg", &select);
        for (atom, column, kind) in refs {
            self.atoms.insert(atom, AtomRef { table: table.clone(), column, kind });
        }
        Ok(())
    }

    fn build_pick(&mut self, id: NodeId) -> CompileResult<()> {
        let Node::PickOneRowPerPatientWithColumns { source, position, sort_keys, selected_columns } =
            self.graph.node(id).clone()
        else {
            unreachable!()
        };
        let (from_table, conditions, mut joins) = self.frame_query_parts(source)?;
        let mut order_by = Vec::with_capacity(sort_keys.len());
        for key in &sort_keys {
            let compiled = self.expr(key.key, Some("t"))?;
            joins.extend(compiled.joins.clone());
            // Picking the last row is a first-row pick over the reversed order.
            let direction = match position {
                Position::First => key.direction,
                Position::Last => key.direction.reversed(),
            };
            let direction = match direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            order_by.push(format!("{} {direction}", compiled.as_value(self.dialect)));
        }
        let mut selects = vec!["t.patient_id AS patient_id".to_string()];
        let mut outer = vec!["patient_id".to_string()];
        for name in &selected_columns {
            selects.push(format!("t.{name} AS {name}"));
            outer.push(name.clone());
        }
        selects.push(format!(
            "ROW_NUMBER() OVER (PARTITION BY t.patient_id ORDER BY {}) AS row_num",
            order_by.join(", ")
        ));
        let inner = render_event_query(&selects, &from_table, &joins, &conditions);
        let select = format!(
            "SELECT {}\nFROM (\n{inner}\n) AS ranked\nWHERE row_num = 1",
            outer.join(", ")
        );
        let table = self.temp_table("pick", &select);
        self.picks.insert(id, table);
        Ok(())
    }

    /// The FROM table, WHERE predicates and joins of a frame's filter chain.
    fn frame_query_parts(
        &mut self,
        frame: NodeId,
    ) -> CompileResult<(String, Vec<String>, BTreeSet<String>)> {
        let chain = self.graph.domain_chain(frame);
        let from_table = match self.graph.node(chain[0]) {
            Node::SelectTable { name, .. } => name.clone(),
            Node::InlineTable { .. } => self.inline_tables[&chain[0]].clone(),
            _ => return Err(CompileError::NotCanonical),
        };
        let mut conditions = Vec::new();
        let mut joins = BTreeSet::new();
        for &filter in &chain[1..] {
            let Node::Filter { condition, .. } = self.graph.node(filter) else {
                unreachable!()
            };
            let compiled = self.expr(*condition, Some("t"))?;
            conditions.push(compiled.as_predicate());
            joins.extend(compiled.joins);
        }
        Ok((from_table, conditions, joins))
    }

    fn build_universe(&mut self, roots: &[NodeId]) -> CompileResult<String> {
        let mut sources = BTreeSet::new();
        for id in self.graph.walk(roots) {
            match self.graph.node(id) {
                Node::SelectTable { name, .. } | Node::SelectPatientTable { name, .. } => {
                    sources.insert(name.clone());
                }
                Node::InlineTable { .. } => {
                    sources.insert(self.inline_tables[&id].clone());
                }
                _ => {}
            }
        }
        let select = if sources.is_empty() {
            "SELECT NULL AS patient_id WHERE 0 = 1".to_string()
        } else {
            sources
                .iter()
                .map(|t| format!("SELECT patient_id FROM {t}"))
                .collect::<Vec<_>>()
                .join("\nUNION\n")
        };
        Ok(self.temp_table("patient_ids", &select))
    }

    //
    // Expressions
    //
    // `anchor` is the row alias of the enclosing event query, or `None` in
    // the patient-level results context.
    //

    fn expr(&mut self, id: NodeId, anchor: Option<&str>) -> CompileResult<Sql> {
        match self.graph.node(id).clone() {
            Node::Value(value) => Ok(Sql::value(self.literal(Some(&value))?)),

            Node::SelectColumn { source, name } => self.column_ref(source, &name, anchor),

            Node::UnaryOp { op, source } => {
                let operand = self.expr(source, anchor)?;
                let joins = operand.joins.clone();
                let sql = match op {
                    UnaryOp::Not => Sql::predicate(format!("NOT ({})", operand.as_predicate())),
                    UnaryOp::IsNull => {
                        Sql::predicate(format!("({}) IS NULL", operand.as_value(self.dialect)))
                    }
                    UnaryOp::Negate => {
                        Sql::value(format!("-({})", operand.as_value(self.dialect)))
                    }
                    UnaryOp::CastToInt => {
                        Sql::value(self.dialect.cast_to_int(&operand.as_value(self.dialect)))
                    }
                    UnaryOp::CastToFloat => {
                        Sql::value(self.dialect.cast_to_float(&operand.as_value(self.dialect)))
                    }
                    UnaryOp::YearFromDate => {
                        Sql::value(self.dialect.year_from_date(&operand.as_value(self.dialect)))
                    }
                    UnaryOp::MonthFromDate => {
                        Sql::value(self.dialect.month_from_date(&operand.as_value(self.dialect)))
                    }
                    UnaryOp::DayFromDate => {
                        Sql::value(self.dialect.day_from_date(&operand.as_value(self.dialect)))
                    }
                    UnaryOp::ToFirstOfMonth => {
                        Sql::value(self.dialect.to_first_of_month(&operand.as_value(self.dialect)))
                    }
                    UnaryOp::ToFirstOfYear => {
                        Sql::value(self.dialect.to_first_of_year(&operand.as_value(self.dialect)))
                    }
                };
                Ok(sql.with_joins(joins))
            }

            Node::BinaryOp { op, lhs, rhs } => self.binary(op, lhs, rhs, anchor),

            Node::NaryOp { op, sources } => {
                let func = match op {
                    NaryOp::MinimumOf => "MIN",
                    NaryOp::MaximumOf => "MAX",
                };
                let mut joins = BTreeSet::new();
                let mut exprs = Vec::with_capacity(sources.len());
                for &source in &sources {
                    let compiled = self.expr(source, anchor)?;
                    exprs.push(compiled.as_value(self.dialect));
                    joins.extend(compiled.joins);
                }
                Ok(Sql::value(self.dialect.horizontal_aggregate(func, &exprs)).with_joins(joins))
            }

            Node::Case { branches, default } => {
                let mut joins = BTreeSet::new();
                let mut sql = String::from("CASE");
                for (condition, outcome) in branches {
                    let condition = self.expr(condition, anchor)?;
                    let outcome = self.expr(outcome, anchor)?;
                    sql.push_str(&format!(
                        " WHEN {} THEN {}",
                        condition.as_predicate(),
                        outcome.as_value(self.dialect)
                    ));
                    joins.extend(condition.joins);
                    joins.extend(outcome.joins);
                }
                if let Some(default) = default {
                    let default = self.expr(default, anchor)?;
                    sql.push_str(&format!(" ELSE {}", default.as_value(self.dialect)));
                    joins.extend(default.joins);
                }
                sql.push_str(" END");
                Ok(Sql::value(sql).with_joins(joins))
            }

            Node::Exists { .. } | Node::Count { .. } | Node::Aggregate { .. } => {
                // Dependency-ordered processing materialized this atom already.
                let atom = self.atoms[&id].clone();
                let mut joins = BTreeSet::new();
                joins.insert(atom.table.clone());
                let sql = match atom.kind {
                    AtomKind::Presence => {
                        Sql::predicate(format!("{}.patient_id IS NOT NULL", atom.table))
                    }
                    AtomKind::ZeroDefault => {
                        Sql::value(format!("COALESCE({}.{}, 0)", atom.table, atom.column))
                    }
                    AtomKind::ZeroWhenAbsent => Sql::value(format!(
                        "CASE WHEN {0}.patient_id IS NULL THEN 0 ELSE {0}.{1} END",
                        atom.table, atom.column
                    )),
                    AtomKind::Plain => Sql::value(format!("{}.{}", atom.table, atom.column)),
                };
                Ok(sql.with_joins(joins))
            }

            Node::SelectTable { .. }
            | Node::SelectPatientTable { .. }
            | Node::InlineTable { .. }
            | Node::Filter { .. }
            | Node::Sort { .. }
            | Node::PickOneRowPerPatient { .. }
            | Node::PickOneRowPerPatientWithColumns { .. } => Err(CompileError::NotCanonical),
        }
    }

    fn column_ref(
        &mut self,
        source: NodeId,
        name: &str,
        anchor: Option<&str>,
    ) -> CompileResult<Sql> {
        match self.graph.node(source) {
            Node::SelectPatientTable { name: table, .. } => {
                let mut joins = BTreeSet::new();
                // In patient context the base table is left-joined onto the
                // universe; in event context onto the event rows.
                joins.insert(table.clone());
                Ok(Sql::value(format!("{table}.{name}")).with_joins(joins))
            }
            Node::PickOneRowPerPatientWithColumns { .. } => {
                let table = self.picks[&source].clone();
                let mut joins = BTreeSet::new();
                joins.insert(table.clone());
                Ok(Sql::value(format!("{table}.{name}")).with_joins(joins))
            }
            Node::PickOneRowPerPatient { .. } | Node::Sort { .. } => {
                Err(CompileError::NotCanonical)
            }
            _ => {
                let Some(anchor) = anchor else {
                    return Err(CompileError::NotCanonical);
                };
                Ok(Sql::value(format!("{anchor}.{name}")))
            }
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        anchor: Option<&str>,
    ) -> CompileResult<Sql> {
        // Membership needs the unevaluated right-hand side.
        if op == BinaryOp::In {
            let Node::Value(Value::StrSet(values)) = self.graph.node(rhs).clone() else {
                return Err(CompileError::Unsupported {
                    operation: "membership test against a computed set".to_string(),
                });
            };
            let needle = self.expr(lhs, anchor)?;
            let joins = needle.joins.clone();
            let needle = needle.as_value(self.dialect);
            let sql = if values.is_empty() {
                // `IN ()` is a syntax error; false for values, null for null.
                format!("{needle} <> {needle}")
            } else if values.len() <= self.config.inline_set_max {
                let items: Vec<String> =
                    values.iter().map(|v| self.dialect.string_literal(v)).collect();
                format!("{needle} IN ({})", items.join(", "))
            } else {
                let table = self.ensure_value_set(rhs, &values);
                format!("{needle} IN (SELECT value FROM {table})")
            };
            return Ok(Sql::predicate(sql).with_joins(joins));
        }

        let left = self.expr(lhs, anchor)?;
        let right = self.expr(rhs, anchor)?;
        let mut joins = left.joins.clone();
        joins.extend(right.joins.clone());
        let d = self.dialect;
        let sql = match op {
            BinaryOp::And => {
                Sql::predicate(format!("({}) AND ({})", left.as_predicate(), right.as_predicate()))
            }
            BinaryOp::Or => {
                Sql::predicate(format!("({}) OR ({})", left.as_predicate(), right.as_predicate()))
            }
            BinaryOp::Eq => Sql::predicate(format!("{} = {}", left.as_value(d), right.as_value(d))),
            BinaryOp::Ne => Sql::predicate(format!("{} <> {}", left.as_value(d), right.as_value(d))),
            BinaryOp::Lt => Sql::predicate(format!("{} < {}", left.as_value(d), right.as_value(d))),
            BinaryOp::Le => Sql::predicate(format!("{} <= {}", left.as_value(d), right.as_value(d))),
            BinaryOp::Gt => Sql::predicate(format!("{} > {}", left.as_value(d), right.as_value(d))),
            BinaryOp::Ge => Sql::predicate(format!("{} >= {}", left.as_value(d), right.as_value(d))),
            BinaryOp::Add => Sql::value(format!("({} + {})", left.as_value(d), right.as_value(d))),
            BinaryOp::Subtract => {
                Sql::value(format!("({} - {})", left.as_value(d), right.as_value(d)))
            }
            BinaryOp::Multiply => {
                Sql::value(format!("({} * {})", left.as_value(d), right.as_value(d)))
            }
            BinaryOp::TrueDivide => Sql::value(format!(
                "({} / NULLIF({}, 0))",
                d.cast_to_float(&left.as_value(d)),
                d.cast_to_float(&right.as_value(d))
            )),
            BinaryOp::FloorDivide => Sql::value(d.cast_to_int(&format!(
                "FLOOR({} / NULLIF({}, 0))",
                d.cast_to_float(&left.as_value(d)),
                d.cast_to_float(&right.as_value(d))
            ))),
            BinaryOp::StringContains => {
                Sql::predicate(d.string_contains(&left.as_value(d), &right.as_value(d)))
            }
            BinaryOp::DateAddDays => {
                Sql::value(d.date_add_days(&left.as_value(d), &right.as_value(d)))
            }
            BinaryOp::DateAddMonths => {
                Sql::value(d.date_add_months(&left.as_value(d), &right.as_value(d)))
            }
            BinaryOp::DateAddYears => {
                Sql::value(d.date_add_years(&left.as_value(d), &right.as_value(d)))
            }
            BinaryOp::DateDifferenceInDays => {
                Sql::value(d.date_difference_in_days(&left.as_value(d), &right.as_value(d)))
            }
            BinaryOp::DateDifferenceInMonths => {
                let (s, e) = (left.as_value(d), right.as_value(d));
                Sql::value(format!(
                    "(({} * 12 + {}) - ({} * 12 + {}) - \
                     (CASE WHEN {} < {} THEN 1 ELSE 0 END))",
                    d.year_from_date(&e),
                    d.month_from_date(&e),
                    d.year_from_date(&s),
                    d.month_from_date(&s),
                    d.day_from_date(&e),
                    d.day_from_date(&s),
                ))
            }
            BinaryOp::DateDifferenceInYears => {
                let (s, e) = (left.as_value(d), right.as_value(d));
                Sql::value(format!(
                    "({} - {} - \
                     (CASE WHEN {} * 100 + {} < {} * 100 + {} THEN 1 ELSE 0 END))",
                    d.year_from_date(&e),
                    d.year_from_date(&s),
                    d.month_from_date(&e),
                    d.day_from_date(&e),
                    d.month_from_date(&s),
                    d.day_from_date(&s),
                ))
            }
            BinaryOp::In => unreachable!(),
        };
        Ok(sql.with_joins(joins))
    }

    fn literal(&self, value: Option<&Value>) -> CompileResult<String> {
        Ok(match value {
            None => "NULL".to_string(),
            Some(Value::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
            Some(Value::Int(i)) => i.to_string(),
            Some(Value::Float(f)) => format!("{f:?}"),
            Some(Value::Str(s)) => self.dialect.string_literal(s),
            Some(Value::Date(d)) => self.dialect.date_literal(*d),
            Some(Value::StrSet(_)) => {
                return Err(CompileError::Unsupported {
                    operation: "a value set outside a membership test".to_string(),
                });
            }
        })
    }
}

fn render_joins(joins: &BTreeSet<String>, anchor: &str) -> String {
    joins
        .iter()
        .map(|j| format!("\nLEFT JOIN {j} ON {j}.patient_id = {anchor}.patient_id"))
        .collect()
}

fn render_event_query(
    selects: &[String],
    from_table: &str,
    joins: &BTreeSet<String>,
    conditions: &[String],
) -> String {
    let mut sql = format!(
        "SELECT {}\nFROM {from_table} AS t{}",
        selects.join(", "),
        render_joins(joins, "t")
    );
    if !conditions.is_empty() {
        let wrapped: Vec<String> = conditions.iter().map(|c| format!("({c})")).collect();
        sql.push_str(&format!("\nWHERE {}", wrapped.join(" AND ")));
    }
    sql
}
