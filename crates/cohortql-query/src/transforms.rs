//! Canonicalizing transform pass
//!
//! Rewrites every `PickOneRowPerPatient` over a chain of `Sort` nodes into a
//! single `PickOneRowPerPatientWithColumns` node carrying the sort-free source,
//! the full ordered key list and the set of columns actually selected off the
//! picked row. Nested sorts compose right-to-left, so the outermost sort is the
//! primary key. Duplicate keys keep their first (outermost) occurrence, and
//! boolean keys are re-encoded through a three-way `Case` (true > false > null)
//! so every backend can order them.
//!
//! `Sort` nodes are erased everywhere during the rewrite; ordering information
//! survives only as explicit keys on canonical picks. This lets two
//! syntactically different but semantically equal sort chains intern to the
//! same node and share one window computation downstream.
//!
//! The pass is idempotent: canonical nodes rebuild to themselves.

use std::collections::{BTreeSet, HashMap};

use crate::nodes::{Dataset, Graph, Node, NodeId, SortDirection, SortKey, UnaryOp};
use crate::schema::ColumnType;
use crate::value::Value;

/// Rewrite all pick-one-row chains reachable from the dataset into canonical
/// form, returning the rewritten dataset. The graph is extended in place; old
/// nodes remain interned but unreferenced.
pub fn apply_transforms(graph: &mut Graph, dataset: &Dataset) -> Dataset {
    let roots = dataset.roots();
    let mut ctx = Rewriter {
        rewritten: HashMap::new(),
        selected: collect_selected_columns(graph, &roots),
    };

    let population = ctx.rewrite(graph, dataset.population);
    let variables = dataset
        .variables
        .iter()
        .map(|(name, &node)| (name.clone(), ctx.rewrite(graph, node)))
        .collect();
    Dataset { population, variables }
}

/// For each raw pick node, the names selected off it anywhere in the graph.
fn collect_selected_columns(
    graph: &Graph,
    roots: &[NodeId],
) -> HashMap<NodeId, BTreeSet<String>> {
    let mut selected: HashMap<NodeId, BTreeSet<String>> = HashMap::new();
    for id in graph.walk(roots) {
        if let Node::SelectColumn { source, name } = graph.node(id)
            && matches!(graph.node(*source), Node::PickOneRowPerPatient { .. })
        {
            selected.entry(*source).or_default().insert(name.clone());
        }
    }
    selected
}

struct Rewriter {
    rewritten: HashMap<NodeId, NodeId>,
    selected: HashMap<NodeId, BTreeSet<String>>,
}

impl Rewriter {
    fn rewrite(&mut self, graph: &mut Graph, id: NodeId) -> NodeId {
        if let Some(&done) = self.rewritten.get(&id) {
            return done;
        }
        let node = graph.node(id).clone();
        let new_id = match node {
            // Sorts are erased; their keys live on in canonical picks.
            Node::Sort { source, .. } => self.rewrite(graph, source),

            Node::PickOneRowPerPatient { source, position } => {
                let stripped = self.rewrite(graph, source);
                let keys = self.collect_sort_keys(graph, source);
                let mut seen = BTreeSet::new();
                let mut sort_keys = Vec::new();
                for (key, direction) in keys {
                    if seen.insert(key) {
                        let key = encode_boolean_key(graph, key);
                        sort_keys.push(SortKey { key, direction });
                    }
                }
                let selected_columns = self.selected.get(&id).cloned().unwrap_or_default();
                graph.intern(Node::PickOneRowPerPatientWithColumns {
                    source: stripped,
                    position,
                    sort_keys,
                    selected_columns,
                })
            }

            Node::SelectTable { .. }
            | Node::SelectPatientTable { .. }
            | Node::InlineTable { .. }
            | Node::Value(_) => id,

            Node::Filter { source, condition } => {
                let source = self.rewrite(graph, source);
                let condition = self.rewrite(graph, condition);
                graph.intern(Node::Filter { source, condition })
            }
            Node::PickOneRowPerPatientWithColumns {
                source,
                position,
                sort_keys,
                selected_columns,
            } => {
                let source = self.rewrite(graph, source);
                let sort_keys = sort_keys
                    .into_iter()
                    .map(|k| SortKey { key: self.rewrite(graph, k.key), direction: k.direction })
                    .collect();
                graph.intern(Node::PickOneRowPerPatientWithColumns {
                    source,
                    position,
                    sort_keys,
                    selected_columns,
                })
            }
            Node::SelectColumn { source, name } => {
                let source = self.rewrite(graph, source);
                graph.intern(Node::SelectColumn { source, name })
            }
            Node::UnaryOp { op, source } => {
                let source = self.rewrite(graph, source);
                graph.intern(Node::UnaryOp { op, source })
            }
            Node::BinaryOp { op, lhs, rhs } => {
                let lhs = self.rewrite(graph, lhs);
                let rhs = self.rewrite(graph, rhs);
                graph.intern(Node::BinaryOp { op, lhs, rhs })
            }
            Node::NaryOp { op, sources } => {
                let sources = sources.iter().map(|&s| self.rewrite(graph, s)).collect();
                graph.intern(Node::NaryOp { op, sources })
            }
            Node::Case { branches, default } => {
                let branches = branches
                    .into_iter()
                    .map(|(c, v)| (self.rewrite(graph, c), self.rewrite(graph, v)))
                    .collect();
                let default = default.map(|d| self.rewrite(graph, d));
                graph.intern(Node::Case { branches, default })
            }
            Node::Exists { source } => {
                let source = self.rewrite(graph, source);
                graph.intern(Node::Exists { source })
            }
            Node::Count { source } => {
                let source = self.rewrite(graph, source);
                graph.intern(Node::Count { source })
            }
            Node::Aggregate { op, source } => {
                let source = self.rewrite(graph, source);
                graph.intern(Node::Aggregate { op, source })
            }
        };
        self.rewritten.insert(id, new_id);
        new_id
    }

    /// Walk a pick's original source chain collecting sort keys outermost
    /// first, rebased onto the rewritten (sort-free) chain.
    fn collect_sort_keys(
        &mut self,
        graph: &mut Graph,
        mut frame: NodeId,
    ) -> Vec<(NodeId, SortDirection)> {
        let mut keys = Vec::new();
        loop {
            match graph.node(frame).clone() {
                Node::Sort { source, sort_by, direction } => {
                    let key = self.rewrite(graph, sort_by);
                    keys.push((key, direction));
                    frame = source;
                }
                Node::Filter { source, .. } => frame = source,
                _ => break,
            }
        }
        keys
    }
}

/// Booleans have no portable sort order with nulls involved, so boolean keys
/// sort by an integer encoding: true -> 2, false -> 1, null -> 0.
fn encode_boolean_key(graph: &mut Graph, key: NodeId) -> NodeId {
    if graph.series_type(key) != Some(ColumnType::Bool) {
        return key;
    }
    let two = graph.value(Value::Int(2));
    let one = graph.value(Value::Int(1));
    let zero = graph.value(Value::Int(0));
    let not_key = graph.intern(Node::UnaryOp { op: UnaryOp::Not, source: key });
    graph.intern(Node::Case {
        branches: vec![(key, two), (not_key, one)],
        default: Some(zero),
    })
}
