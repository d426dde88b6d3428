//! Reverse lineage: which columns change when a source column changes
//!
//! The whole query is expanded into one graph, then every node reachable
//! from the starting columns along "feeds into" edges is reported, grouped
//! into final output columns and CTE columns.

use crate::expand::{GraphBuilder, OnFailure};
use crate::graph::{LineageGraph, LineageNode, NodeId, NodeKind};
use crate::query::LineageQuery;
use indexmap::IndexMap;
use serde::Serialize;
use sqlineage_core::{Diagnostic, DiagnosticCode, LimitsConfig, LineageError};
use sqlineage_sql::{cte_key, find_line_numbers, truncate_expr, ScopeId, ScopeKind, ScopeTree, SourceKind, FINAL_SELECT};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct ImpactOptions {
    /// Leave expressions out of the entries
    pub summary_only: bool,

    pub max_expr_length: Option<usize>,

    /// Cap on `available_source_columns`; `None` or 0 lists all
    pub max_sources: Option<usize>,

    pub include_line_numbers: bool,

    pub include_graph: bool,

    pub limits: LimitsConfig,
}

/// Impact of a source column, or why none could be computed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ImpactResult {
    Impacted(ImpactReport),
    NotFound(ImpactFailure),
}

impl ImpactResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Impacted(_))
    }

    pub fn report(&self) -> Option<&ImpactReport> {
        match self {
            Self::Impacted(report) => Some(report),
            Self::NotFound(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactReport {
    pub success: bool,
    pub source_column: String,
    pub impact_summary: ImpactSummary,
    pub impacted_output_columns: Vec<ImpactedOutput>,
    pub impacted_cte_columns: Vec<ImpactedCteColumn>,
    pub available_source_columns: Vec<String>,

    /// `cte:<name>` and `final_select` mapped to their 1-based line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_numbers: Option<IndexMap<String, usize>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<ImpactGraph>,

    /// References left out of the graph because they failed qualification
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImpactSummary {
    pub output_columns_affected: usize,
    pub cte_columns_affected: usize,
    pub total_affected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactedOutput {
    pub column: String,
    pub position: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// 1-based UNION branches that read the source column
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<usize>>,

    /// Starting columns that reach this one, when there are several
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_hint: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactedCteColumn {
    pub cte: String,
    pub column: String,
    pub position: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<usize>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_hint: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactFailure {
    pub success: bool,
    pub source_column: String,
    pub error: String,
    pub code: DiagnosticCode,
    pub available_source_columns: Vec<String>,
    pub hint: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// Impacted subgraph, starting columns included
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactGraph {
    pub nodes: Vec<ImpactGraphNode>,
    pub edges: Vec<ImpactGraphEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactNodeKind {
    Source,
    Output,
    Cte,
    Subquery,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactGraphNode {
    pub id: NodeId,
    pub kind: ImpactNodeKind,
    pub label: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImpactGraphEdge {
    pub source: NodeId,
    pub target: NodeId,
}

/// Find every column affected by `source_column` (`column`, `table.column`,
/// `alias.column` or `cte.column`)
pub fn impact(query: &LineageQuery<'_>, source_column: &str, options: &ImpactOptions) -> Result<ImpactResult, LineageError> {
    let tree = &query.tree;
    let mut builder = GraphBuilder::new(tree, query.schema, options.limits, OnFailure::Record);
    builder.build_all()?;
    let (graph, diagnostics) = builder.finish();

    let available_source_columns = available_sources(tree, &graph, options.max_sources);
    let starts = start_nodes(tree, &graph, source_column);

    if starts.is_empty() {
        tracing::debug!(source_column, "source column not found");
        let hint = match available_source_columns.first() {
            Some(example) => format!("Use one of the available source columns, e.g. '{}'.", example),
            None => "Provide a schema with --schema when the query selects * from its sources.".to_string(),
        };
        return Ok(ImpactResult::NotFound(ImpactFailure {
            success: false,
            source_column: source_column.to_string(),
            error: format!("Source column '{}' not found in query", source_column),
            code: DiagnosticCode::TargetNotFound,
            available_source_columns,
            hint,
            diagnostics,
        }));
    }

    // impacted node -> starting nodes reaching it
    let start_set: HashSet<NodeId> = starts.iter().copied().collect();
    let mut reached: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
    for start in &starts {
        for id in graph.downstream(*start) {
            if !start_set.contains(&id) {
                reached.entry(id).or_default().push(*start);
            }
        }
    }

    let line_numbers = options
        .include_line_numbers
        .then(|| find_line_numbers(query.sql, &tree.cte_names()));

    let mut outputs: IndexMap<usize, ImpactedOutput> = IndexMap::new();
    let mut ctes: IndexMap<(ScopeId, usize), ImpactedCteColumn> = IndexMap::new();

    for (id, via) in &reached {
        let Some(node) = graph.node(*id) else {
            continue;
        };
        let (Some(scope), Some(position)) = (node.scope, node.position) else {
            continue;
        };

        let context = tree.context_of(scope);
        let context_scope = tree.scope(context);
        let Some(column) = context_scope.output_at(position) else {
            continue;
        };

        let branch = branch_number(tree, scope);
        let via = (starts.len() > 1).then(|| {
            via.iter()
                .filter_map(|s| graph.node(*s))
                .map(|n| n.name.clone())
                .collect::<Vec<_>>()
        });
        let expression = (!options.summary_only).then(|| truncate_expr(&column.expression, options.max_expr_length));

        match context_scope.kind {
            ScopeKind::Root => {
                let entry = outputs.entry(position).or_insert_with(|| ImpactedOutput {
                    column: column.name.clone(),
                    position,
                    expression,
                    branches: None,
                    via: None,
                    line_hint: line_numbers.as_ref().and_then(|l| l.get(FINAL_SELECT).copied()),
                });
                merge_branch(&mut entry.branches, branch);
                merge_via(&mut entry.via, via);
            }
            ScopeKind::Cte => {
                let name = context_scope.name.clone().unwrap_or_default();
                let line_hint = line_numbers.as_ref().and_then(|l| l.get(&cte_key(&name)).copied());
                let entry = ctes.entry((context, position)).or_insert_with(|| ImpactedCteColumn {
                    cte: name,
                    column: column.name.clone(),
                    position,
                    expression,
                    branches: None,
                    via: None,
                    line_hint,
                });
                merge_branch(&mut entry.branches, branch);
                merge_via(&mut entry.via, via);
            }
            ScopeKind::Subquery | ScopeKind::UnionBranch => {}
        }
    }

    let mut impacted_output_columns: Vec<ImpactedOutput> = outputs.into_values().collect();
    impacted_output_columns.sort_by_key(|c| c.position);

    let cte_order: HashMap<ScopeId, usize> = tree
        .ctes_breadth_first()
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();
    let mut cte_entries: Vec<((ScopeId, usize), ImpactedCteColumn)> = ctes.into_iter().collect();
    cte_entries.sort_by_key(|((scope, position), _)| (cte_order.get(scope).copied().unwrap_or(usize::MAX), *position));
    let impacted_cte_columns: Vec<ImpactedCteColumn> = cte_entries.into_iter().map(|(_, c)| c).collect();

    let graph_view = options.include_graph.then(|| {
        let mut included: Vec<NodeId> = starts.clone();
        included.extend(reached.keys().copied());
        impact_graph(tree, &graph, &included)
    });

    let summary = ImpactSummary {
        output_columns_affected: impacted_output_columns.len(),
        cte_columns_affected: impacted_cte_columns.len(),
        total_affected: impacted_output_columns.len() + impacted_cte_columns.len(),
    };

    tracing::debug!(
        source_column,
        starts = starts.len(),
        total_affected = summary.total_affected,
        "impact analysis complete"
    );

    Ok(ImpactResult::Impacted(ImpactReport {
        success: true,
        source_column: source_column.to_string(),
        impact_summary: summary,
        impacted_output_columns,
        impacted_cte_columns,
        available_source_columns,
        line_numbers,
        graph: graph_view,
        diagnostics,
    }))
}

/// Position of a UNION branch inside its parent, 1-based
fn branch_number(tree: &ScopeTree, scope: ScopeId) -> Option<usize> {
    let current = tree.scope(scope);
    if current.kind != ScopeKind::UnionBranch {
        return None;
    }
    let parent = tree.scope(current.parent?);
    parent.branches.iter().position(|b| *b == scope).map(|i| i + 1)
}

fn merge_branch(branches: &mut Option<Vec<usize>>, branch: Option<usize>) {
    if let Some(branch) = branch {
        let list = branches.get_or_insert_with(Vec::new);
        if !list.contains(&branch) {
            list.push(branch);
            list.sort_unstable();
        }
    }
}

fn merge_via(current: &mut Option<Vec<String>>, via: Option<Vec<String>>) {
    if let Some(via) = via {
        let list = current.get_or_insert_with(Vec::new);
        for name in via {
            if !list.contains(&name) {
                list.push(name);
            }
        }
    }
}

/// Graph nodes standing for the requested source column
fn start_nodes(tree: &ScopeTree, graph: &LineageGraph, source_column: &str) -> Vec<NodeId> {
    let (qualifier, column) = match source_column.rsplit_once('.') {
        Some((q, c)) if !q.is_empty() => (Some(q), c),
        _ => (None, source_column),
    };

    let tables: Vec<NodeId> = graph
        .nodes()
        .filter(|(_, n)| n.kind == NodeKind::Table && n.column.eq_ignore_ascii_case(column))
        .filter(|(_, n)| match (qualifier, &n.table) {
            (None, _) => true,
            (Some(q), Some(table)) => table_matches(tree, table, q),
            (Some(_), None) => false,
        })
        .map(|(id, _)| id)
        .collect();

    if !tables.is_empty() {
        return tables;
    }

    let scopes: Vec<ScopeId> = match qualifier {
        Some(q) => cte_scopes_named(tree, q),
        None => tree.ctes_breadth_first(),
    };

    graph
        .nodes()
        .filter(|(_, n)| n.kind != NodeKind::Table && n.column.eq_ignore_ascii_case(column))
        .filter(|(_, n)| n.scope.is_some_and(|s| scopes.contains(&s)))
        .map(|(id, _)| id)
        .collect()
}

/// `table` (as written in FROM) answers to `qualifier` by name, last name
/// segment, or an alias used anywhere in the query
fn table_matches(tree: &ScopeTree, table: &str, qualifier: &str) -> bool {
    if table.eq_ignore_ascii_case(qualifier) {
        return true;
    }
    if table.rsplit_once('.').is_some_and(|(_, last)| last.eq_ignore_ascii_case(qualifier)) {
        return true;
    }

    tree.iter().flat_map(|s| s.sources.iter()).any(|source| {
        source.matches_alias(qualifier)
            && matches!(&source.kind, SourceKind::Table { qualified_name, .. } if qualified_name.eq_ignore_ascii_case(table))
    })
}

/// CTE scopes called `name`, or aliased `name` where they are read
fn cte_scopes_named(tree: &ScopeTree, name: &str) -> Vec<ScopeId> {
    let mut scopes: Vec<ScopeId> = tree
        .ctes_breadth_first()
        .into_iter()
        .filter(|id| tree.scope(*id).name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
        .collect();

    for source in tree.iter().flat_map(|s| s.sources.iter()) {
        if let SourceKind::Cte { scope, .. } = &source.kind {
            if source.matches_alias(name) && !scopes.contains(scope) {
                scopes.push(*scope);
            }
        }
    }

    scopes
}

/// Physical columns and CTE columns a caller may ask about
fn available_sources(tree: &ScopeTree, graph: &LineageGraph, max_sources: Option<usize>) -> Vec<String> {
    let mut names = BTreeSet::new();

    for (_, node) in graph.nodes() {
        match node.kind {
            NodeKind::Table => {
                names.insert(node.name.clone());
            }
            NodeKind::Derived => {
                if node.scope.is_some_and(|s| tree.scope(s).kind == ScopeKind::Cte) {
                    names.insert(node.name.clone());
                }
            }
            NodeKind::Subquery | NodeKind::Ambiguous => {}
        }
    }

    let names = names.into_iter();
    match max_sources.filter(|m| *m > 0) {
        Some(max) => names.take(max).collect(),
        None => names.collect(),
    }
}

fn impact_graph(tree: &ScopeTree, graph: &LineageGraph, included: &[NodeId]) -> ImpactGraph {
    let set: HashSet<NodeId> = included.iter().copied().collect();

    let nodes = included
        .iter()
        .filter_map(|id| graph.node(*id).map(|node| (*id, node)))
        .map(|(id, node)| ImpactGraphNode {
            id,
            kind: graph_kind(tree, node),
            label: node.name.clone(),
            column: Some(node.column.clone()),
        })
        .collect();

    let edges = graph
        .edges()
        .iter()
        .filter(|e| set.contains(&e.from) && set.contains(&e.to))
        .map(|e| ImpactGraphEdge { source: e.from, target: e.to })
        .collect();

    ImpactGraph { nodes, edges }
}

fn graph_kind(tree: &ScopeTree, node: &LineageNode) -> ImpactNodeKind {
    let Some(scope) = node.scope else {
        return ImpactNodeKind::Source;
    };
    match tree.scope(tree.context_of(scope)).kind {
        ScopeKind::Root => ImpactNodeKind::Output,
        ScopeKind::Cte => ImpactNodeKind::Cte,
        ScopeKind::Subquery | ScopeKind::UnionBranch => ImpactNodeKind::Subquery,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlineage_core::Schema;
    use sqlineage_sql::SqlParser;

    fn report(sql: &str, source: &str, options: &ImpactOptions) -> ImpactReport {
        let schema = Schema::new();
        let query = LineageQuery::parse(&SqlParser::new(), sql, &schema).unwrap();
        match impact(&query, source, options).unwrap() {
            ImpactResult::Impacted(report) => report,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn union_branches_are_reported() {
        let sql = "SELECT id, amount FROM orders UNION ALL SELECT id, 0 AS amount FROM refunds";
        let result = report(sql, "orders.amount", &ImpactOptions::default());

        assert_eq!(result.impacted_output_columns.len(), 1);
        assert_eq!(result.impacted_output_columns[0].column, "amount");
        assert_eq!(result.impacted_output_columns[0].branches, Some(vec![1]));
    }

    #[test]
    fn bare_column_starts_from_every_table() {
        let sql = "SELECT o.id AS order_id, c.id AS customer_id FROM orders o JOIN customers c ON o.customer_id = c.id";
        let result = report(sql, "id", &ImpactOptions::default());

        assert_eq!(result.impact_summary.output_columns_affected, 2);
        assert_eq!(result.impacted_output_columns[0].via, Some(vec!["orders.id".to_string()]));
        assert_eq!(result.impacted_output_columns[1].via, Some(vec!["customers.id".to_string()]));
    }

    #[test]
    fn alias_and_cte_qualifiers() {
        let sql = "WITH totals AS (SELECT customer_id, SUM(amount) AS total FROM orders o GROUP BY customer_id) \
                   SELECT t.total * 2 AS doubled FROM totals t";

        let by_alias = report(sql, "o.amount", &ImpactOptions::default());
        assert_eq!(by_alias.impact_summary.total_affected, 2);

        let by_cte = report(sql, "totals.total", &ImpactOptions::default());
        assert_eq!(by_cte.impact_summary.cte_columns_affected, 0);
        assert_eq!(by_cte.impacted_output_columns[0].column, "doubled");

        let by_cte_alias = report(sql, "t.total", &ImpactOptions::default());
        assert_eq!(by_cte_alias.impacted_output_columns.len(), 1);
    }

    #[test]
    fn summary_only_drops_expressions_and_lines_are_attached() {
        let sql = "WITH a AS (\n  SELECT amount FROM orders\n)\nSELECT amount FROM a";
        let options = ImpactOptions { summary_only: true, include_line_numbers: true, ..Default::default() };
        let result = report(sql, "orders.amount", &options);

        assert!(result.impacted_output_columns.iter().all(|c| c.expression.is_none()));
        assert_eq!(result.impacted_output_columns[0].line_hint, Some(4));
        assert_eq!(result.impacted_cte_columns[0].line_hint, Some(1));
        assert_eq!(result.line_numbers.unwrap().get("cte:a"), Some(&1));
    }

    #[test]
    fn graph_view_contains_impacted_subgraph() {
        let sql = "WITH a AS (SELECT amount FROM orders) SELECT amount, 1 AS one FROM a";
        let options = ImpactOptions { include_graph: true, ..Default::default() };
        let graph = report(sql, "orders.amount", &options).graph.unwrap();

        let kinds: Vec<ImpactNodeKind> = graph.nodes.iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![ImpactNodeKind::Source, ImpactNodeKind::Cte, ImpactNodeKind::Output]);
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn unknown_source_lists_available_columns() {
        let schema = Schema::new();
        let query = LineageQuery::parse(&SqlParser::new(), "SELECT id, amount FROM orders", &schema).unwrap();
        let options = ImpactOptions { max_sources: Some(1), ..Default::default() };

        match impact(&query, "orders.missing", &options).unwrap() {
            ImpactResult::NotFound(failure) => {
                assert!(!failure.success);
                assert_eq!(failure.code, DiagnosticCode::TargetNotFound);
                assert_eq!(failure.available_source_columns, vec!["orders.amount"]);
                assert!(failure.hint.contains("orders.amount"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
