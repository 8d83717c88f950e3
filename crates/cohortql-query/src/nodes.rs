//! The node graph: interned relational operations over per-patient tables
//!
//! Nodes are built through the [`Graph`] arena. Constructors validate the
//! cardinality and domain compatibility of their operands and return
//! `Result<NodeId, GraphError>`; structurally equal constructions return the
//! same handle, so repeated sub-expressions compile and evaluate exactly once.
//!
//! Cardinality is static: every frame and series is either one-row-per-patient
//! or many-rows-per-patient. A domain is the equivalence class of a many-rows
//! frame, identified by its chain of filters over a root table. Two event-level
//! series may only be combined when one domain chain is a prefix of the other;
//! anything else would silently join tables of different per-patient row counts.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::error::{GraphError, GraphResult};
use crate::schema::{ColumnType, TableSchema};
use crate::value::{PatientId, Value};

/// Stable handle to an interned node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

/// Which end of the sorted rows a row selection keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    First,
    Last,
}

/// Per-key sort direction. Descending negates the comparison for that key
/// only, not the whole sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn reversed(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

/// One canonical sort key: a series plus its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub key: NodeId,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    IsNull,
    Negate,
    CastToInt,
    CastToFloat,
    YearFromDate,
    MonthFromDate,
    DayFromDate,
    ToFirstOfYear,
    ToFirstOfMonth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    TrueDivide,
    FloorDivide,
    StringContains,
    In,
    DateAddDays,
    DateAddMonths,
    DateAddYears,
    DateDifferenceInDays,
    DateDifferenceInMonths,
    DateDifferenceInYears,
}

/// N-ary cross-series operations. Unlike the binary arithmetic ops these
/// disregard null operands instead of propagating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NaryOp {
    MinimumOf,
    MaximumOf,
}

/// Series-sourced patient aggregations. `Exists` and `Count` are
/// frame-sourced and have their own node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    CountDistinct,
    Min,
    Max,
    Sum,
    Mean,
    CombineAsSet,
}

/// One row of an inline literal table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InlineRow {
    pub patient_id: PatientId,
    pub values: Vec<Option<Value>>,
}

/// One immutable relational operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    /// A many-rows-per-patient base table.
    SelectTable { name: String, schema: TableSchema },
    /// A one-row-per-patient base table.
    SelectPatientTable { name: String, schema: TableSchema },
    /// An ad-hoc literal table, many rows per patient.
    InlineTable { schema: TableSchema, rows: Vec<InlineRow> },
    Filter { source: NodeId, condition: NodeId },
    Sort { source: NodeId, sort_by: NodeId, direction: SortDirection },
    PickOneRowPerPatient { source: NodeId, position: Position },
    /// Canonical form produced by the transform pass: the sort chain collapsed
    /// into an explicit multi-key sort over a sort-free source, plus the set of
    /// columns actually selected off the picked row.
    PickOneRowPerPatientWithColumns {
        source: NodeId,
        position: Position,
        sort_keys: Vec<SortKey>,
        selected_columns: BTreeSet<String>,
    },
    SelectColumn { source: NodeId, name: String },
    Value(Value),
    UnaryOp { op: UnaryOp, source: NodeId },
    BinaryOp { op: BinaryOp, lhs: NodeId, rhs: NodeId },
    NaryOp { op: NaryOp, sources: SmallVec<[NodeId; 4]> },
    /// Branches are evaluated in declaration order; the first branch whose
    /// condition is true wins. Null conditions are skipped, not matched.
    Case { branches: Vec<(NodeId, NodeId)>, default: Option<NodeId> },
    Exists { source: NodeId },
    Count { source: NodeId },
    Aggregate { op: AggregateOp, source: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// The equivalence class determining safe join/comparison boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// One-row-per-patient; combinable with anything.
    Patient,
    /// Many rows per patient, identified by the frame (root table or filter)
    /// that defines the row set.
    Events(NodeId),
}

/// Interning arena holding every node of a query graph.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<Node, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Intern a node without validation. Used by constructors after their
    /// checks have passed and by the transform pass, which only rebuilds nodes
    /// that were already validated.
    pub(crate) fn intern(&mut self, node: Node) -> NodeId {
        if let Some(&id) = self.index.get(&node) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node.clone());
        self.index.insert(node, id);
        id
    }

    //
    // Constructors
    //

    pub fn select_table(&mut self, name: impl Into<String>, schema: TableSchema) -> NodeId {
        self.intern(Node::SelectTable { name: name.into(), schema })
    }

    pub fn select_patient_table(
        &mut self,
        name: impl Into<String>,
        schema: TableSchema,
    ) -> NodeId {
        self.intern(Node::SelectPatientTable { name: name.into(), schema })
    }

    pub fn inline_table(
        &mut self,
        schema: TableSchema,
        rows: Vec<InlineRow>,
    ) -> GraphResult<NodeId> {
        for row in &rows {
            if row.values.len() != schema.len() {
                return Err(GraphError::InlineRowArity {
                    expected: schema.len(),
                    found: row.values.len(),
                });
            }
            for ((name, def), value) in schema.columns().zip(&row.values) {
                if let Some(value) = value
                    && value.column_type() != Some(def.column_type)
                {
                    return Err(GraphError::InlineValueType {
                        column: name.to_string(),
                        expected: def.column_type.to_string(),
                        found: value
                            .column_type()
                            .map_or_else(|| "set".to_string(), |t| t.to_string()),
                    });
                }
            }
        }
        Ok(self.intern(Node::InlineTable { schema, rows }))
    }

    pub fn value(&mut self, value: Value) -> NodeId {
        self.intern(Node::Value(value))
    }

    pub fn select_column(&mut self, source: NodeId, name: impl Into<String>) -> GraphResult<NodeId> {
        let name = name.into();
        self.expect_frame("select_column", source)?;
        let (table, schema) = self.root_table(source);
        if schema.column(&name).is_none() {
            return Err(GraphError::UnknownColumn { table: table.to_string(), column: name });
        }
        if let Node::PickOneRowPerPatientWithColumns { selected_columns, .. } = self.node(source)
            && !selected_columns.contains(&name)
        {
            let table = table.to_string();
            return Err(GraphError::UnknownColumn { table, column: name });
        }
        Ok(self.intern(Node::SelectColumn { source, name }))
    }

    pub fn filter(&mut self, source: NodeId, condition: NodeId) -> GraphResult<NodeId> {
        self.expect_many_frame("filter", source)?;
        self.expect_series("filter condition", condition)?;
        self.expect_boolean("filter condition", condition)?;
        self.expect_subordinate("filter", source, condition)?;
        Ok(self.intern(Node::Filter { source, condition }))
    }

    pub fn sort(
        &mut self,
        source: NodeId,
        sort_by: NodeId,
        direction: SortDirection,
    ) -> GraphResult<NodeId> {
        self.expect_many_frame("sort", source)?;
        self.expect_series("sort key", sort_by)?;
        self.expect_subordinate("sort", source, sort_by)?;
        Ok(self.intern(Node::Sort { source, sort_by, direction }))
    }

    pub fn pick_one_row_per_patient(
        &mut self,
        source: NodeId,
        position: Position,
    ) -> GraphResult<NodeId> {
        if !matches!(self.node(source), Node::Sort { .. }) {
            return Err(GraphError::UnsortedSource);
        }
        Ok(self.intern(Node::PickOneRowPerPatient { source, position }))
    }

    pub fn unary(&mut self, op: UnaryOp, source: NodeId) -> GraphResult<NodeId> {
        self.expect_series("unary operation", source)?;
        Ok(self.intern(Node::UnaryOp { op, source }))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> GraphResult<NodeId> {
        self.expect_series("binary operation", lhs)?;
        self.expect_series("binary operation", rhs)?;
        self.merge_domains(self.domain(lhs), self.domain(rhs))?;
        Ok(self.intern(Node::BinaryOp { op, lhs, rhs }))
    }

    pub fn nary(&mut self, op: NaryOp, sources: Vec<NodeId>) -> GraphResult<NodeId> {
        if sources.is_empty() {
            return Err(GraphError::EmptyOperands {
                operation: "n-ary operation".to_string(),
            });
        }
        let mut domain = Domain::Patient;
        for &source in &sources {
            self.expect_series("n-ary operation", source)?;
            domain = self.merge_domains(domain, self.domain(source))?;
        }
        Ok(self.intern(Node::NaryOp { op, sources: SmallVec::from_vec(sources) }))
    }

    pub fn case(
        &mut self,
        branches: Vec<(NodeId, NodeId)>,
        default: Option<NodeId>,
    ) -> GraphResult<NodeId> {
        if branches.is_empty() {
            return Err(GraphError::EmptyCase);
        }
        let mut domain = Domain::Patient;
        for &(condition, outcome) in &branches {
            self.expect_series("case condition", condition)?;
            self.expect_boolean("case condition", condition)?;
            self.expect_series("case outcome", outcome)?;
            domain = self.merge_domains(domain, self.domain(condition))?;
            domain = self.merge_domains(domain, self.domain(outcome))?;
        }
        if let Some(default) = default {
            self.expect_series("case default", default)?;
            self.merge_domains(domain, self.domain(default))?;
        }
        Ok(self.intern(Node::Case { branches, default }))
    }

    pub fn exists(&mut self, source: NodeId) -> GraphResult<NodeId> {
        self.expect_many_frame("exists", source)?;
        Ok(self.intern(Node::Exists { source }))
    }

    pub fn count(&mut self, source: NodeId) -> GraphResult<NodeId> {
        self.expect_many_frame("count", source)?;
        Ok(self.intern(Node::Count { source }))
    }

    pub fn aggregate(&mut self, op: AggregateOp, source: NodeId) -> GraphResult<NodeId> {
        self.expect_series("aggregation", source)?;
        if self.cardinality(source) != Cardinality::Many {
            return Err(GraphError::CardinalityMismatch {
                operation: "aggregation".to_string(),
                expected: "a many-rows-per-patient series".to_string(),
                found: self.describe(source),
            });
        }
        Ok(self.intern(Node::Aggregate { op, source }))
    }

    //
    // Shape, cardinality and domain rules
    //

    pub fn is_frame(&self, id: NodeId) -> bool {
        matches!(
            self.node(id),
            Node::SelectTable { .. }
                | Node::SelectPatientTable { .. }
                | Node::InlineTable { .. }
                | Node::Filter { .. }
                | Node::Sort { .. }
                | Node::PickOneRowPerPatient { .. }
                | Node::PickOneRowPerPatientWithColumns { .. }
        )
    }

    pub fn cardinality(&self, id: NodeId) -> Cardinality {
        match self.node(id) {
            Node::SelectTable { .. } | Node::InlineTable { .. } => Cardinality::Many,
            Node::SelectPatientTable { .. } => Cardinality::One,
            Node::Filter { source, .. } | Node::Sort { source, .. } => self.cardinality(*source),
            Node::PickOneRowPerPatient { .. } | Node::PickOneRowPerPatientWithColumns { .. } => {
                Cardinality::One
            }
            Node::SelectColumn { source, .. } => self.cardinality(*source),
            Node::Value(_) => Cardinality::One,
            Node::UnaryOp { source, .. } => self.cardinality(*source),
            Node::BinaryOp { lhs, rhs, .. } => {
                if self.cardinality(*lhs) == Cardinality::Many
                    || self.cardinality(*rhs) == Cardinality::Many
                {
                    Cardinality::Many
                } else {
                    Cardinality::One
                }
            }
            Node::NaryOp { sources, .. } => {
                if sources.iter().any(|&s| self.cardinality(s) == Cardinality::Many) {
                    Cardinality::Many
                } else {
                    Cardinality::One
                }
            }
            Node::Case { branches, default } => {
                let many = branches
                    .iter()
                    .flat_map(|&(c, v)| [c, v])
                    .chain(default.iter().copied())
                    .any(|n| self.cardinality(n) == Cardinality::Many);
                if many { Cardinality::Many } else { Cardinality::One }
            }
            Node::Exists { .. } | Node::Count { .. } | Node::Aggregate { .. } => Cardinality::One,
        }
    }

    pub fn domain(&self, id: NodeId) -> Domain {
        if self.cardinality(id) == Cardinality::One {
            return Domain::Patient;
        }
        match self.node(id) {
            Node::SelectTable { .. } | Node::InlineTable { .. } | Node::Filter { .. } => {
                Domain::Events(id)
            }
            Node::Sort { source, .. } => self.domain(*source),
            Node::SelectColumn { source, .. } | Node::UnaryOp { source, .. } => {
                self.domain(*source)
            }
            Node::BinaryOp { lhs, rhs, .. } => {
                // Operands were validated at construction so the merge is known good.
                self.merged_domain_of([*lhs, *rhs])
            }
            Node::NaryOp { sources, .. } => self.merged_domain_of(sources.iter().copied()),
            Node::Case { branches, default } => self.merged_domain_of(
                branches
                    .iter()
                    .flat_map(|&(c, v)| [c, v])
                    .chain(default.iter().copied()),
            ),
            _ => Domain::Patient,
        }
    }

    fn merged_domain_of(&self, ids: impl IntoIterator<Item = NodeId>) -> Domain {
        let mut domain = Domain::Patient;
        for id in ids {
            domain = self
                .merge_domains(domain, self.domain(id))
                .unwrap_or(domain);
        }
        domain
    }

    /// The chain of filters (plus the root table) defining a frame's domain,
    /// root first. Sorts are domain-transparent and skipped.
    pub fn domain_chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cur = id;
        loop {
            match self.node(cur) {
                Node::Filter { source, .. } => {
                    chain.push(cur);
                    cur = *source;
                }
                Node::Sort { source, .. } => cur = *source,
                _ => {
                    chain.push(cur);
                    break;
                }
            }
        }
        chain.reverse();
        chain
    }

    /// Combine two domains, failing when neither chain is a prefix of the other.
    pub fn merge_domains(&self, a: Domain, b: Domain) -> GraphResult<Domain> {
        match (a, b) {
            (Domain::Patient, d) | (d, Domain::Patient) => Ok(d),
            (Domain::Events(x), Domain::Events(y)) => {
                if x == y {
                    return Ok(Domain::Events(x));
                }
                let cx = self.domain_chain(x);
                let cy = self.domain_chain(y);
                if cx.len() <= cy.len() && cy[..cx.len()] == cx[..] {
                    Ok(Domain::Events(y))
                } else if cy.len() < cx.len() && cx[..cy.len()] == cy[..] {
                    Ok(Domain::Events(x))
                } else {
                    Err(GraphError::DomainMismatch {
                        left: self.describe_domain(x),
                        right: self.describe_domain(y),
                    })
                }
            }
        }
    }

    /// The base table a frame or frame chain is rooted in, with its schema.
    pub fn root_table(&self, id: NodeId) -> (&str, &TableSchema) {
        match self.node(id) {
            Node::SelectTable { name, schema } | Node::SelectPatientTable { name, schema } => {
                (name, schema)
            }
            Node::InlineTable { schema, .. } => ("inline", schema),
            Node::Filter { source, .. }
            | Node::Sort { source, .. }
            | Node::PickOneRowPerPatient { source, .. }
            | Node::PickOneRowPerPatientWithColumns { source, .. } => self.root_table(*source),
            other => unreachable!("root_table called on non-frame node {other:?}"),
        }
    }

    fn describe_domain(&self, id: NodeId) -> String {
        let chain = self.domain_chain(id);
        let (table, _) = self.root_table(chain[0]);
        match chain.len() - 1 {
            0 => format!("table '{table}'"),
            1 => format!("table '{table}' with 1 filter"),
            n => format!("table '{table}' with {n} filters"),
        }
    }

    fn describe(&self, id: NodeId) -> String {
        let shape = if self.is_frame(id) { "frame" } else { "series" };
        match self.cardinality(id) {
            Cardinality::One => format!("a one-row-per-patient {shape}"),
            Cardinality::Many => format!("a many-rows-per-patient {shape}"),
        }
    }

    fn expect_frame(&self, operation: &str, id: NodeId) -> GraphResult<()> {
        if self.is_frame(id) {
            Ok(())
        } else {
            Err(GraphError::CardinalityMismatch {
                operation: operation.to_string(),
                expected: "a frame".to_string(),
                found: self.describe(id),
            })
        }
    }

    fn expect_many_frame(&self, operation: &str, id: NodeId) -> GraphResult<()> {
        if self.is_frame(id) && self.cardinality(id) == Cardinality::Many {
            Ok(())
        } else {
            Err(GraphError::CardinalityMismatch {
                operation: operation.to_string(),
                expected: "a many-rows-per-patient frame".to_string(),
                found: self.describe(id),
            })
        }
    }

    fn expect_series(&self, operation: &str, id: NodeId) -> GraphResult<()> {
        if self.is_frame(id) {
            Err(GraphError::CardinalityMismatch {
                operation: operation.to_string(),
                expected: "a series".to_string(),
                found: self.describe(id),
            })
        } else {
            Ok(())
        }
    }

    fn expect_boolean(&self, operation: &str, id: NodeId) -> GraphResult<()> {
        match self.series_type(id) {
            Some(ColumnType::Bool) => Ok(()),
            other => Err(GraphError::CardinalityMismatch {
                operation: operation.to_string(),
                expected: "a boolean series".to_string(),
                found: other.map_or_else(|| "an untyped series".to_string(), |t| t.to_string()),
            }),
        }
    }

    /// A series used inside a frame operation (filter condition, sort key) must
    /// be patient-level or drawn from the frame's own chain, never deeper.
    fn expect_subordinate(&self, operation: &str, frame: NodeId, series: NodeId) -> GraphResult<()> {
        let frame_domain = self.domain(frame);
        let merged = self.merge_domains(frame_domain, self.domain(series))?;
        if merged == frame_domain {
            Ok(())
        } else {
            let Domain::Events(deeper) = merged else { unreachable!() };
            Err(GraphError::DomainMismatch {
                left: format!("{operation} source {}", self.describe_domain_of(frame_domain)),
                right: self.describe_domain(deeper),
            })
        }
    }

    fn describe_domain_of(&self, domain: Domain) -> String {
        match domain {
            Domain::Patient => "patient level".to_string(),
            Domain::Events(id) => self.describe_domain(id),
        }
    }

    //
    // Type inference
    //

    /// The primitive type of a series, where one is representable.
    /// `CombineAsSet` aggregations produce sets, which have no column type.
    pub fn series_type(&self, id: NodeId) -> Option<ColumnType> {
        match self.node(id) {
            Node::SelectColumn { source, name } => {
                let (_, schema) = self.root_table(*source);
                schema.column_type(name)
            }
            Node::Value(v) => v.column_type(),
            Node::UnaryOp { op, source } => match op {
                UnaryOp::Not | UnaryOp::IsNull => Some(ColumnType::Bool),
                UnaryOp::Negate => self.series_type(*source),
                UnaryOp::CastToInt
                | UnaryOp::YearFromDate
                | UnaryOp::MonthFromDate
                | UnaryOp::DayFromDate => Some(ColumnType::Int),
                UnaryOp::CastToFloat => Some(ColumnType::Float),
                UnaryOp::ToFirstOfYear | UnaryOp::ToFirstOfMonth => Some(ColumnType::Date),
            },
            Node::BinaryOp { op, lhs, rhs } => match op {
                BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::StringContains
                | BinaryOp::In => Some(ColumnType::Bool),
                BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply => {
                    match (self.series_type(*lhs), self.series_type(*rhs)) {
                        (Some(ColumnType::Float), _) | (_, Some(ColumnType::Float)) => {
                            Some(ColumnType::Float)
                        }
                        _ => Some(ColumnType::Int),
                    }
                }
                BinaryOp::TrueDivide => Some(ColumnType::Float),
                BinaryOp::FloorDivide => Some(ColumnType::Int),
                BinaryOp::DateAddDays | BinaryOp::DateAddMonths | BinaryOp::DateAddYears => {
                    Some(ColumnType::Date)
                }
                BinaryOp::DateDifferenceInDays
                | BinaryOp::DateDifferenceInMonths
                | BinaryOp::DateDifferenceInYears => Some(ColumnType::Int),
            },
            Node::NaryOp { sources, .. } => self.series_type(sources[0]),
            Node::Case { branches, default } => branches
                .first()
                .and_then(|&(_, v)| self.series_type(v))
                .or_else(|| default.and_then(|d| self.series_type(d))),
            Node::Exists { .. } => Some(ColumnType::Bool),
            Node::Count { .. } => Some(ColumnType::Int),
            Node::Aggregate { op, source } => match op {
                AggregateOp::CountDistinct => Some(ColumnType::Int),
                AggregateOp::Min | AggregateOp::Max | AggregateOp::Sum => {
                    self.series_type(*source)
                }
                AggregateOp::Mean => Some(ColumnType::Float),
                AggregateOp::CombineAsSet => None,
            },
            // Frames have no series type.
            _ => None,
        }
    }

    //
    // Traversal
    //

    /// The nodes a node directly references, in declaration order.
    pub fn operands(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id) {
            Node::SelectTable { .. }
            | Node::SelectPatientTable { .. }
            | Node::InlineTable { .. }
            | Node::Value(_) => Vec::new(),
            Node::Filter { source, condition } => vec![*source, *condition],
            Node::Sort { source, sort_by, .. } => vec![*source, *sort_by],
            Node::PickOneRowPerPatient { source, .. } => vec![*source],
            Node::PickOneRowPerPatientWithColumns { source, sort_keys, .. } => {
                let mut out = vec![*source];
                out.extend(sort_keys.iter().map(|k| k.key));
                out
            }
            Node::SelectColumn { source, .. } => vec![*source],
            Node::UnaryOp { source, .. } => vec![*source],
            Node::BinaryOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Node::NaryOp { sources, .. } => sources.to_vec(),
            Node::Case { branches, default } => branches
                .iter()
                .flat_map(|&(c, v)| [c, v])
                .chain(default.iter().copied())
                .collect(),
            Node::Exists { source } | Node::Count { source } | Node::Aggregate { source, .. } => {
                vec![*source]
            }
        }
    }

    /// All nodes reachable from `roots` in dependency order: every node appears
    /// after all of its operands and exactly once. Later stages rely on this to
    /// allocate temporary tables and caches for dependencies before their users.
    pub fn walk(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<(NodeId, bool)> =
            roots.iter().rev().map(|&r| (r, false)).collect();
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                if seen.insert(id) {
                    out.push(id);
                }
                continue;
            }
            if seen.contains(&id) {
                continue;
            }
            stack.push((id, true));
            for operand in self.operands(id).into_iter().rev() {
                stack.push((operand, false));
            }
        }
        out
    }

    /// Patient ids appearing in inline tables reachable from `roots`. These
    /// must be part of the patient universe even when no backend table
    /// mentions them.
    pub fn inline_patient_ids(&self, roots: &[NodeId]) -> BTreeSet<PatientId> {
        let mut ids = BTreeSet::new();
        for node in self.walk(roots) {
            if let Node::InlineTable { rows, .. } = self.node(node) {
                ids.extend(rows.iter().map(|r| r.patient_id));
            }
        }
        ids
    }
}

/// A complete query: a population definition plus named output series.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub population: NodeId,
    pub variables: IndexMap<String, NodeId>,
}

impl Dataset {
    pub fn new(population: NodeId, variables: IndexMap<String, NodeId>) -> Self {
        Self { population, variables }
    }

    /// Population first, then variables in declaration order.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots = vec![self.population];
        roots.extend(self.variables.values().copied());
        roots
    }

    /// Check the dataset-level contract: population is a one-row-per-patient
    /// boolean series and every output is a one-row-per-patient series.
    pub fn validate(&self, graph: &Graph) -> GraphResult<()> {
        if graph.is_frame(self.population)
            || graph.cardinality(self.population) != Cardinality::One
            || graph.series_type(self.population) != Some(ColumnType::Bool)
        {
            return Err(GraphError::InvalidPopulation);
        }
        for (name, &node) in &self.variables {
            if graph.is_frame(node) || graph.cardinality(node) != Cardinality::One {
                return Err(GraphError::CardinalityMismatch {
                    operation: format!("output '{name}'"),
                    expected: "a one-row-per-patient series".to_string(),
                    found: graph.describe(node),
                });
            }
        }
        Ok(())
    }
}
