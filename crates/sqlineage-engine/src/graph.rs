//! Column lineage graph
//!
//! Nodes are columns: physical table columns, or output columns of a scope.
//! Edges point from an input column to the column it feeds into.

use serde::Serialize;
use sqlineage_sql::{ScopeId, ScopeKind};
use std::collections::{HashMap, HashSet, VecDeque};

/// Index of a node inside its [`LineageGraph`]
pub type NodeId = usize;

/// Identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// Physical column, compared case-insensitively
    Table { table: String, column: String },

    /// Output column of a scope, by position
    Column { scope: ScopeId, position: usize },

    /// Reference that could not be attributed to a single source
    Ambiguous { scope: ScopeId, reference: String },
}

impl NodeKey {
    pub fn table(table: &str, column: &str) -> Self {
        Self::Table {
            table: table.to_ascii_lowercase(),
            column: column.to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Terminal physical column
    Table,

    /// Column computed by the root, a CTE or a UNION branch
    Derived,

    /// Column computed by a derived table or expression subquery
    Subquery,

    /// Unresolvable ambiguous reference
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineageNode {
    /// Display name (`orders.amount`, `step1.amount`, `total`)
    pub name: String,

    pub kind: NodeKind,

    /// Defining expression; the error message for ambiguous nodes
    pub expression: Option<String>,

    /// Owning scope, `None` for table columns
    pub scope: Option<ScopeId>,

    pub scope_kind: Option<ScopeKind>,

    /// Scope label (`step1`, `t`, `union#2`); `None` for the root
    pub label: Option<String>,

    pub position: Option<usize>,

    /// Physical table, for table nodes
    pub table: Option<String>,

    pub column: String,
}

/// Directed edge: `from` feeds into `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LineageEdge {
    pub from: NodeId,
    pub to: NodeId,
}

/// Column dependency graph
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    nodes: Vec<LineageNode>,
    index: HashMap<NodeKey, NodeId>,
    edges: Vec<LineageEdge>,

    /// node -> nodes it is computed from
    inputs: HashMap<NodeId, Vec<NodeId>>,

    /// node -> nodes computed from it
    consumers: HashMap<NodeId, Vec<NodeId>>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node unless one with the same key exists. Returns the id and
    /// whether the node is new.
    pub fn insert(&mut self, key: NodeKey, node: LineageNode) -> (NodeId, bool) {
        if let Some(id) = self.index.get(&key) {
            return (*id, false);
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(key, id);
        (id, true)
    }

    /// Add `from -> to` unless present
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        let inputs = self.inputs.entry(to).or_default();
        if inputs.contains(&from) {
            return;
        }
        inputs.push(from);
        self.consumers.entry(from).or_default().push(to);
        self.edges.push(LineageEdge { from, to });
    }

    pub fn node(&self, id: NodeId) -> Option<&LineageNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &LineageNode)> {
        self.nodes.iter().enumerate()
    }

    pub fn edges(&self) -> &[LineageEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Immediate inputs of a node
    pub fn inputs(&self, id: NodeId) -> &[NodeId] {
        self.inputs.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Immediate consumers of a node
    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        self.consumers.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every node that transitively depends on `id`, in BFS order
    pub fn downstream(&self, id: NodeId) -> Vec<NodeId> {
        self.reach(&[id], |graph, node| graph.consumers(node))
    }

    /// Every node `id` transitively depends on, in BFS order
    pub fn upstream(&self, id: NodeId) -> Vec<NodeId> {
        self.reach(&[id], |graph, node| graph.inputs(node))
    }

    fn reach<'g, F>(&'g self, start: &[NodeId], next: F) -> Vec<NodeId>
    where
        F: Fn(&'g Self, NodeId) -> &'g [NodeId],
    {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut result = Vec::new();

        for id in start {
            queue.extend(next(self, *id).iter().copied());
        }

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            result.push(current);

            for following in next(self, current) {
                if !visited.contains(following) {
                    queue.push_back(*following);
                }
            }
        }

        result
    }

    /// Topological order (inputs before consumers). On a cycle, returns the
    /// lowest node that could not be ordered.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, NodeId> {
        let mut in_degree: Vec<usize> = (0..self.nodes.len()).map(|id| self.inputs(id).len()).collect();
        let mut queue: VecDeque<NodeId> = (0..self.nodes.len()).filter(|id| in_degree[*id] == 0).collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(current) = queue.pop_front() {
            result.push(current);
            for consumer in self.consumers(current) {
                in_degree[*consumer] -= 1;
                if in_degree[*consumer] == 0 {
                    queue.push_back(*consumer);
                }
            }
        }

        if result.len() == self.nodes.len() {
            return Ok(result);
        }

        let ordered: HashSet<NodeId> = result.into_iter().collect();
        Err((0..self.nodes.len()).find(|id| !ordered.contains(id)).unwrap_or_default())
    }

    /// Longest-path depth of every node reachable from `root` through its
    /// inputs. The root has depth 0 and depth grows by at least one along
    /// every edge away from it.
    pub fn depths_from(&self, root: NodeId) -> HashMap<NodeId, usize> {
        let mut reachable: HashSet<NodeId> = self.upstream(root).into_iter().collect();
        reachable.insert(root);

        // Kahn over the reachable subgraph, walking from consumers to inputs
        let mut pending: HashMap<NodeId, usize> = reachable
            .iter()
            .map(|id| {
                let consumers = self.consumers(*id).iter().filter(|c| reachable.contains(c)).count();
                (*id, consumers)
            })
            .collect();

        let mut depths: HashMap<NodeId, usize> = HashMap::from([(root, 0)]);
        let mut queue = VecDeque::from([root]);

        while let Some(current) = queue.pop_front() {
            let depth = depths.get(&current).copied().unwrap_or(0);
            for input in self.inputs(current) {
                let entry = depths.entry(*input).or_insert(0);
                *entry = (*entry).max(depth + 1);

                if let Some(count) = pending.get_mut(input) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        queue.push_back(*input);
                    }
                }
            }
        }

        depths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(name: &str, kind: NodeKind) -> LineageNode {
        LineageNode {
            name: name.to_string(),
            kind,
            expression: None,
            scope: None,
            scope_kind: None,
            label: None,
            position: None,
            table: None,
            column: name.to_string(),
        }
    }

    /// orders.amount -> a -> b -> out, orders.amount -> out
    fn diamond() -> (LineageGraph, [NodeId; 4]) {
        let mut graph = LineageGraph::new();
        let (src, _) = graph.insert(NodeKey::table("orders", "amount"), node("orders.amount", NodeKind::Table));
        let (a, _) = graph.insert(NodeKey::Column { scope: 1, position: 1 }, node("a", NodeKind::Derived));
        let (b, _) = graph.insert(NodeKey::Column { scope: 2, position: 1 }, node("b", NodeKind::Derived));
        let (out, _) = graph.insert(NodeKey::Column { scope: 0, position: 1 }, node("out", NodeKind::Derived));
        graph.add_edge(src, a);
        graph.add_edge(a, b);
        graph.add_edge(b, out);
        graph.add_edge(src, out);
        (graph, [src, a, b, out])
    }

    #[test]
    fn insert_deduplicates_by_key() {
        let mut graph = LineageGraph::new();
        let (first, new) = graph.insert(NodeKey::table("Orders", "ID"), node("orders.id", NodeKind::Table));
        assert!(new);
        let (second, new) = graph.insert(NodeKey::table("orders", "id"), node("orders.id", NodeKind::Table));
        assert!(!new);
        assert_eq!(first, second);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let (mut graph, [src, _, _, out]) = diamond();
        graph.add_edge(src, out);
        assert_eq!(graph.edges().len(), 4);
        assert_eq!(graph.inputs(out).len(), 2);
    }

    #[test]
    fn downstream_and_upstream() {
        let (graph, [src, a, b, out]) = diamond();

        let mut down = graph.downstream(src);
        down.sort();
        assert_eq!(down, vec![a, b, out]);

        let mut up = graph.upstream(out);
        up.sort();
        assert_eq!(up, vec![src, a, b]);

        assert!(graph.downstream(out).is_empty());
    }

    #[test]
    fn topological_order_puts_inputs_first() {
        let (graph, [src, a, b, out]) = diamond();
        let order = graph.topological_sort().unwrap();
        let at = |id| order.iter().position(|n| *n == id).unwrap();

        assert!(at(src) < at(a));
        assert!(at(a) < at(b));
        assert!(at(b) < at(out));
    }

    #[test]
    fn topological_sort_reports_a_cycle() {
        let (mut graph, [src, a, b, _]) = diamond();
        graph.add_edge(b, a);

        assert_eq!(graph.topological_sort(), Err(a));
        assert!(graph.downstream(src).contains(&b));
    }

    #[test]
    fn depth_is_longest_path() {
        let (graph, [src, a, b, out]) = diamond();
        let depths = graph.depths_from(out);

        assert_eq!(depths[&out], 0);
        assert_eq!(depths[&b], 1);
        assert_eq!(depths[&a], 2);
        assert_eq!(depths[&src], 3);

        for edge in graph.edges() {
            assert!(depths[&edge.from] > depths[&edge.to]);
        }
    }
}
