//! Lineage graph construction
//!
//! Expands output columns of a qualified scope tree into a [`LineageGraph`].
//! Every column is expanded at most once per builder; the memo is dropped
//! with the builder at the end of the request.

use crate::graph::{LineageGraph, LineageNode, NodeId, NodeKey, NodeKind};
use sqlineage_core::{Diagnostic, LimitsConfig, LineageError, Schema};
use sqlineage_sql::{
    ColumnDef, ColumnRef, ColumnTarget, Lateral, OutputColumn, Qualifier, Resolution, ScopeId, ScopeKind,
    ScopeTree,
};
use std::collections::{HashMap, HashSet};

/// What to do with a reference that fails qualification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Abort expansion with the error
    Abort,

    /// Record a diagnostic and leave the reference out of the graph
    Record,
}

/// Request-scoped builder of a [`LineageGraph`]
pub struct GraphBuilder<'a> {
    tree: &'a ScopeTree,
    qualifier: Qualifier<'a>,
    limits: LimitsConfig,
    on_failure: OnFailure,
    graph: LineageGraph,
    memo: HashMap<(ScopeId, usize), Vec<NodeId>>,
    in_progress: HashSet<(ScopeId, usize)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(tree: &'a ScopeTree, schema: &'a Schema, limits: LimitsConfig, on_failure: OnFailure) -> Self {
        Self {
            tree,
            qualifier: Qualifier::new(tree, schema),
            limits,
            on_failure,
            graph: LineageGraph::new(),
            memo: HashMap::new(),
            in_progress: HashSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Expand one output column. Returns the nodes standing for it: a single
    /// node, or the inputs of a pass-through derived-table column.
    pub fn expand(&mut self, scope: ScopeId, position: usize) -> Result<Vec<NodeId>, LineageError> {
        self.column_nodes(scope, position, 0)
    }

    /// Expand every output column of every scope and check the result is
    /// acyclic
    pub fn build_all(&mut self) -> Result<(), LineageError> {
        for scope in self.tree.iter() {
            for column in &scope.outputs {
                self.column_nodes(scope.id, column.position, 0)?;
            }
        }

        if let Err(node) = self.graph.topological_sort() {
            let name = self.graph.node(node).map(|n| n.name.clone()).unwrap_or_default();
            return Err(LineageError::CycleDetected { node: name });
        }

        tracing::debug!(
            nodes = self.graph.len(),
            edges = self.graph.edges().len(),
            "built lineage graph"
        );
        Ok(())
    }

    pub fn graph(&self) -> &LineageGraph {
        &self.graph
    }

    pub fn finish(self) -> (LineageGraph, Vec<Diagnostic>) {
        (self.graph, self.diagnostics)
    }

    fn column_nodes(&mut self, scope: ScopeId, position: usize, depth: usize) -> Result<Vec<NodeId>, LineageError> {
        if let Some(nodes) = self.memo.get(&(scope, position)) {
            return Ok(nodes.clone());
        }
        if depth > self.limits.max_depth {
            return Err(LineageError::DepthLimitExceeded { limit: self.limits.max_depth });
        }

        let tree = self.tree;
        let Some(column) = tree.scope(scope).output_at(position) else {
            return Ok(Vec::new());
        };

        if !self.in_progress.insert((scope, position)) {
            return Err(LineageError::CycleDetected { node: self.node_name(scope, column) });
        }

        let result = if self.is_transparent(scope, column) {
            self.inputs(scope, column, depth + 1)
        } else {
            self.derived_node(scope, column, depth)
        };

        self.in_progress.remove(&(scope, position));
        let nodes = result?;
        self.memo.insert((scope, position), nodes.clone());
        Ok(nodes)
    }

    fn derived_node(&mut self, scope: ScopeId, column: &OutputColumn, depth: usize) -> Result<Vec<NodeId>, LineageError> {
        let context = self.tree.scope(self.tree.context_of(scope));
        let kind = match context.kind {
            ScopeKind::Subquery => NodeKind::Subquery,
            _ => NodeKind::Derived,
        };

        let node = LineageNode {
            name: self.node_name(scope, column),
            kind,
            expression: Some(column.expression.clone()),
            scope: Some(scope),
            scope_kind: Some(self.tree.scope(scope).kind),
            label: self.tree.label(scope),
            position: Some(column.position),
            table: None,
            column: column.name.clone(),
        };

        let id = self.insert(NodeKey::Column { scope, position: column.position }, node)?;
        for input in self.inputs(scope, column, depth + 1)? {
            self.graph.add_edge(input, id);
        }
        Ok(vec![id])
    }

    /// Derived-table columns that only forward a reference get no node
    fn is_transparent(&self, scope: ScopeId, column: &OutputColumn) -> bool {
        self.tree.scope(scope).kind == ScopeKind::Subquery && column.is_passthrough()
    }

    fn inputs(&mut self, scope: ScopeId, column: &OutputColumn, depth: usize) -> Result<Vec<NodeId>, LineageError> {
        let mut nodes = Vec::new();

        match &column.def {
            ColumnDef::UnionOf(branches) => {
                for branch in branches {
                    nodes.extend(self.column_nodes(*branch, column.position, depth)?);
                }
            }
            ColumnDef::UnresolvedStar { .. } => {}
            ColumnDef::Expr { refs, subqueries } => {
                for column_ref in refs {
                    nodes.extend(self.ref_nodes(scope, column_ref, depth)?);
                }
                for subquery in subqueries {
                    let tree = self.tree;
                    for output in &tree.scope(*subquery).outputs {
                        nodes.extend(self.column_nodes(*subquery, output.position, depth)?);
                    }
                }
            }
        }

        Ok(nodes)
    }

    fn ref_nodes(&mut self, scope: ScopeId, column_ref: &ColumnRef, depth: usize) -> Result<Vec<NodeId>, LineageError> {
        match &column_ref.resolution {
            Resolution::Resolved(resolved) => self.target_nodes(resolved.scope, &resolved.target, depth),
            Resolution::Failed(err) => self.failure(scope, &column_ref.display_name(), err.clone()),
            Resolution::Pending => {
                let resolved = self.qualifier.resolve(
                    scope,
                    column_ref.qualifier.as_deref(),
                    &column_ref.column,
                    Lateral::None,
                );
                match resolved {
                    Ok(resolved) => self.target_nodes(resolved.scope, &resolved.target, depth),
                    Err(err) => self.failure(scope, &column_ref.display_name(), err),
                }
            }
        }
    }

    fn target_nodes(&mut self, owner: ScopeId, target: &ColumnTarget, depth: usize) -> Result<Vec<NodeId>, LineageError> {
        match target {
            ColumnTarget::Table { table, column } => Ok(vec![self.table_node(table, column)?]),
            ColumnTarget::Scope { scope, position: Some(position), .. } => self.column_nodes(*scope, *position, depth),
            ColumnTarget::Scope { scope, position: None, column } => {
                if depth > self.limits.max_depth {
                    return Err(LineageError::DepthLimitExceeded { limit: self.limits.max_depth });
                }

                let mut nodes = Vec::new();
                for resolved in self.qualifier.resolve_behind_star(*scope, column) {
                    match resolved {
                        Ok(resolved) => nodes.extend(self.target_nodes(resolved.scope, &resolved.target, depth + 1)?),
                        Err(err) => nodes.extend(self.failure(*scope, column, err)?),
                    }
                }
                Ok(nodes)
            }
            ColumnTarget::Lateral { position } => self.column_nodes(owner, *position, depth),
        }
    }

    fn table_node(&mut self, table: &str, column: &str) -> Result<NodeId, LineageError> {
        let node = LineageNode {
            name: format!("{}.{}", table, column),
            kind: NodeKind::Table,
            expression: None,
            scope: None,
            scope_kind: None,
            label: None,
            position: None,
            table: Some(table.to_string()),
            column: column.to_string(),
        };
        self.insert(NodeKey::table(table, column), node)
    }

    /// Ambiguous references become nodes; anything else aborts or is recorded
    fn failure(&mut self, scope: ScopeId, reference: &str, err: LineageError) -> Result<Vec<NodeId>, LineageError> {
        if let LineageError::AmbiguousColumn { column, .. } = &err {
            let node = LineageNode {
                name: reference.to_string(),
                kind: NodeKind::Ambiguous,
                expression: Some(err.to_string()),
                scope: Some(scope),
                scope_kind: Some(self.tree.scope(scope).kind),
                label: self.tree.label(scope),
                position: None,
                table: None,
                column: column.clone(),
            };
            let key = NodeKey::Ambiguous { scope, reference: reference.to_ascii_lowercase() };
            return Ok(vec![self.insert(key, node)?]);
        }

        match self.on_failure {
            OnFailure::Abort => Err(err),
            OnFailure::Record => {
                let diagnostic = err.to_diagnostic();
                if !self.diagnostics.contains(&diagnostic) {
                    self.diagnostics.push(diagnostic);
                }
                Ok(Vec::new())
            }
        }
    }

    fn insert(&mut self, key: NodeKey, node: LineageNode) -> Result<NodeId, LineageError> {
        let (id, new) = self.graph.insert(key, node);
        if new && self.graph.len() > self.limits.max_nodes {
            return Err(LineageError::GraphTooLarge { limit: self.limits.max_nodes });
        }
        Ok(id)
    }

    fn node_name(&self, scope: ScopeId, column: &OutputColumn) -> String {
        match self.tree.label(scope) {
            Some(label) => format!("{}.{}", label, column.name),
            None => column.name.clone(),
        }
    }
}
