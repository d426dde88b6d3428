//! Forward lineage of a single column
//!
//! A target found in the final SELECT is expanded down to source tables.
//! A target that only exists inside CTEs is reported with its direct sources
//! and is not expanded unless [`TraceOptions::recurse_ctes`] is set.

use crate::expand::{GraphBuilder, OnFailure};
use crate::graph::{LineageGraph, NodeId, NodeKind};
use crate::query::LineageQuery;
use serde::Serialize;
use sqlineage_core::{DiagnosticCode, LimitsConfig, LineageError};
use sqlineage_sql::analyze::column_sources;
use sqlineage_sql::{truncate_expr, ScopeId, ScopeTree};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Keep nodes up to this depth; `None` or 0 keeps everything
    pub depth: Option<usize>,

    pub max_expr_length: Option<usize>,

    pub limits: LimitsConfig,

    /// Expand CTE matches down to their source tables
    pub recurse_ctes: bool,
}

/// Outcome of a trace
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum TraceResult {
    FoundInOutput(OutputTrace),
    FoundInCte(CteTrace),
    NotFound(TraceNotFound),
    Failed(TraceFailure),
}

impl TraceResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::FoundInOutput(_) | Self::FoundInCte(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputTrace {
    pub success: bool,
    pub column: String,
    pub in_final_output: bool,

    #[serde(flatten)]
    pub graph: TraceGraph,
}

/// Expansion of one column, root node first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceGraph {
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<TraceEdge>,
    pub source_tables: Vec<String>,

    /// Nodes deeper than the requested depth were left out
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    pub depth: usize,
    pub name: String,
    pub expression: Option<String>,

    #[serde(rename = "type")]
    pub kind: NodeKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

/// `from` (input) feeds into `to`, both indexes into `nodes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceEdge {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CteTrace {
    pub success: bool,
    pub column: String,
    pub in_final_output: bool,
    pub found_in: Vec<CteMatch>,
    pub available_ctes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CteMatch {
    pub location: &'static str,
    pub cte_name: String,
    pub expression: String,

    /// Direct sources as `relation.column`
    pub sources: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_lineage: Option<TraceGraph>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNotFound {
    pub success: bool,
    pub column: String,
    pub error: String,
    pub code: DiagnosticCode,
    pub available_in_output: Vec<String>,
    pub available_ctes: Vec<String>,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceFailure {
    pub success: bool,
    pub column: String,
    pub error: String,
    pub code: DiagnosticCode,
    pub hint: String,
}

impl TraceFailure {
    fn new(column: &str, err: &LineageError) -> Self {
        Self {
            success: false,
            column: column.to_string(),
            error: err.to_string(),
            code: err.code(),
            hint: err.hint(),
        }
    }
}

/// Trace `target` (`column` or `relation.column`) through the query
pub fn trace(query: &LineageQuery<'_>, target: &str, options: &TraceOptions) -> TraceResult {
    let (qualifier, column) = split_target(target);
    let tree = &query.tree;
    let cte_qualified = qualifier.is_some_and(|q| tree.cte_names().iter().any(|n| n.eq_ignore_ascii_case(q)));

    if !cte_qualified {
        if let Some(position) = output_position(tree, qualifier, column) {
            tracing::debug!(target, position, "found in final output");

            return match expand_column(query, ScopeTree::ROOT, position, options) {
                Ok(graph) => TraceResult::FoundInOutput(OutputTrace {
                    success: true,
                    column: target.to_string(),
                    in_final_output: true,
                    graph,
                }),
                Err(err) => TraceResult::Failed(TraceFailure::new(target, &err)),
            };
        }
    }

    let cte_filter = if cte_qualified { qualifier } else { None };
    match cte_matches(query, cte_filter, column, options) {
        Ok(found_in) if !found_in.is_empty() => TraceResult::FoundInCte(CteTrace {
            success: true,
            column: target.to_string(),
            in_final_output: false,
            found_in,
            available_ctes: tree.cte_names(),
        }),
        Ok(_) => TraceResult::NotFound(not_found(tree, target)),
        Err(err) => TraceResult::Failed(TraceFailure::new(target, &err)),
    }
}

/// `orders.amount` -> (Some("orders"), "amount")
fn split_target(target: &str) -> (Option<&str>, &str) {
    match target.rsplit_once('.') {
        Some((qualifier, column)) if !qualifier.is_empty() => (Some(qualifier), column),
        _ => (None, target),
    }
}

/// Root output matching the target. With several same-named outputs the
/// qualifier picks the one read from that relation.
fn output_position(tree: &ScopeTree, qualifier: Option<&str>, column: &str) -> Option<usize> {
    let root = tree.root();
    let candidates: Vec<usize> = root
        .outputs
        .iter()
        .filter(|c| c.name.eq_ignore_ascii_case(column))
        .map(|c| c.position)
        .collect();

    let Some(qualifier) = qualifier else {
        return candidates.first().copied();
    };

    candidates
        .iter()
        .copied()
        .find(|position| {
            column_sources(tree, ScopeTree::ROOT, *position).iter().any(|source| {
                source.table.eq_ignore_ascii_case(qualifier)
                    || source
                        .table
                        .rsplit_once('.')
                        .is_some_and(|(_, last)| last.eq_ignore_ascii_case(qualifier))
            })
        })
        .or_else(|| candidates.first().copied())
}

fn cte_matches(
    query: &LineageQuery<'_>,
    cte_filter: Option<&str>,
    column: &str,
    options: &TraceOptions,
) -> Result<Vec<CteMatch>, LineageError> {
    let tree = &query.tree;
    let mut matches = Vec::new();

    for id in tree.ctes_breadth_first() {
        let scope = tree.scope(id);
        let Some(name) = scope.name.clone() else {
            continue;
        };
        if cte_filter.is_some_and(|f| !f.eq_ignore_ascii_case(&name)) {
            continue;
        }

        for output in scope.outputs.iter().filter(|c| c.name.eq_ignore_ascii_case(column)) {
            let mut sources: Vec<String> = Vec::new();
            for source in column_sources(tree, id, output.position) {
                let rendered = format!("{}.{}", source.table, source.column);
                if !sources.contains(&rendered) {
                    sources.push(rendered);
                }
            }

            let full_lineage = if options.recurse_ctes {
                Some(expand_column(query, id, output.position, options)?)
            } else {
                None
            };

            matches.push(CteMatch {
                location: "cte",
                cte_name: name.clone(),
                expression: truncate_expr(&output.expression, options.max_expr_length),
                sources,
                full_lineage,
            });
        }
    }

    Ok(matches)
}

fn not_found(tree: &ScopeTree, target: &str) -> TraceNotFound {
    let root = tree.root();
    let available_in_output = root.output_names();
    let available_ctes = tree.cte_names();

    let hint = if root.has_unresolved_star() {
        "The final SELECT reads * from a source without a known schema; provide --schema to expand it.".to_string()
    } else if !available_in_output.is_empty() {
        format!("Available output columns: {}", available_in_output.join(", "))
    } else {
        "Check the column name for typos.".to_string()
    };

    TraceNotFound {
        success: false,
        column: target.to_string(),
        error: format!("Column '{}' not found in final output or any CTE", target),
        code: DiagnosticCode::TargetNotFound,
        available_in_output,
        available_ctes,
        hint,
    }
}

fn expand_column(
    query: &LineageQuery<'_>,
    scope: ScopeId,
    position: usize,
    options: &TraceOptions,
) -> Result<TraceGraph, LineageError> {
    let mut builder = GraphBuilder::new(&query.tree, query.schema, options.limits, OnFailure::Abort);
    let roots = builder.expand(scope, position)?;
    let (graph, _) = builder.finish();

    match roots.first() {
        Some(root) => Ok(trace_graph(&graph, *root, options)),
        None => Ok(TraceGraph {
            nodes: Vec::new(),
            edges: Vec::new(),
            source_tables: Vec::new(),
            truncated: false,
        }),
    }
}

/// Flatten the part of `graph` feeding `root`, in BFS order from the root
fn trace_graph(graph: &LineageGraph, root: NodeId, options: &TraceOptions) -> TraceGraph {
    let depths = graph.depths_from(root);
    let limit = options.depth.filter(|d| *d > 0);

    let order: Vec<NodeId> = std::iter::once(root).chain(graph.upstream(root)).collect();
    let kept: Vec<NodeId> = order
        .iter()
        .copied()
        .filter(|id| limit.map_or(true, |l| depths.get(id).copied().unwrap_or(0) <= l))
        .collect();
    let truncated = kept.len() < order.len();

    let index: HashMap<NodeId, usize> = kept.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut nodes = Vec::with_capacity(kept.len());
    let mut edges = Vec::new();
    let mut source_tables = BTreeSet::new();

    for id in &kept {
        let Some(node) = graph.node(*id) else {
            continue;
        };

        if let Some(table) = &node.table {
            source_tables.insert(table.clone());
        }

        nodes.push(TraceNode {
            depth: depths.get(id).copied().unwrap_or(0),
            name: node.name.clone(),
            expression: node.expression.as_deref().map(|e| truncate_expr(e, options.max_expr_length)),
            kind: node.kind,
            table: node.table.clone(),
            column: node.table.as_ref().map(|_| node.column.clone()),
        });

        for input in graph.inputs(*id) {
            if let (Some(from), Some(to)) = (index.get(input), index.get(id)) {
                edges.push(TraceEdge { from: *from, to: *to });
            }
        }
    }

    TraceGraph {
        nodes,
        edges,
        source_tables: source_tables.into_iter().collect(),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlineage_core::Schema;
    use sqlineage_sql::SqlParser;

    fn run(sql: &str, target: &str, options: &TraceOptions) -> TraceResult {
        let schema = Schema::new();
        let query = LineageQuery::parse(&SqlParser::new(), sql, &schema).unwrap();
        trace(&query, target, options)
    }

    #[test]
    fn split_target_handles_dotted_names() {
        assert_eq!(split_target("amount"), (None, "amount"));
        assert_eq!(split_target("orders.amount"), (Some("orders"), "amount"));
        assert_eq!(split_target("raw.orders.amount"), (Some("raw.orders"), "amount"));
    }

    #[test]
    fn depth_option_cuts_the_graph() {
        let sql = "WITH step1 AS (SELECT amount FROM orders), \
                   step2 AS (SELECT amount * 1.1 AS adjusted FROM step1) \
                   SELECT adjusted FROM step2";

        let options = TraceOptions { depth: Some(1), ..Default::default() };
        match run(sql, "adjusted", &options) {
            TraceResult::FoundInOutput(found) => {
                let names: Vec<&str> = found.graph.nodes.iter().map(|n| n.name.as_str()).collect();
                assert_eq!(names, vec!["adjusted", "step2.adjusted"]);
                assert!(found.graph.truncated);
                assert!(found.graph.source_tables.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn qualified_target_picks_matching_output() {
        let schema = Schema::new()
            .with_table("users", [("id", "INT")])
            .with_table("orders", [("id", "INT"), ("user_id", "INT")]);
        let sql = "SELECT * FROM users JOIN orders ON users.id = orders.user_id";
        let query = LineageQuery::parse(&SqlParser::new(), sql, &schema).unwrap();

        match trace(&query, "orders.id", &TraceOptions::default()) {
            TraceResult::FoundInOutput(found) => assert_eq!(found.graph.source_tables, vec!["orders"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cte_qualified_target_searches_that_cte() {
        let sql = "WITH a AS (SELECT id FROM users), b AS (SELECT id FROM orders) SELECT id FROM a";

        match run(sql, "b.id", &TraceOptions::default()) {
            TraceResult::FoundInCte(found) => {
                assert_eq!(found.found_in.len(), 1);
                assert_eq!(found.found_in[0].cte_name, "b");
                assert_eq!(found.found_in[0].sources, vec!["orders.id"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn recurse_ctes_expands_matches() {
        let sql = "WITH a AS (SELECT amount * 2 AS doubled FROM orders) SELECT 1 AS one FROM a";
        let options = TraceOptions { recurse_ctes: true, ..Default::default() };

        match run(sql, "doubled", &options) {
            TraceResult::FoundInCte(found) => {
                let lineage = found.found_in[0].full_lineage.as_ref().unwrap();
                assert_eq!(lineage.source_tables, vec!["orders"]);
                assert_eq!(lineage.nodes[0].name, "a.doubled");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_qualifier_fails_with_hint() {
        match run("SELECT x.id AS id FROM users u", "id", &TraceOptions::default()) {
            TraceResult::Failed(failure) => {
                assert_eq!(failure.code, DiagnosticCode::UnknownTable);
                assert!(failure.hint.contains('u'));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn serializes_with_result_tag() {
        let result = run("SELECT id FROM users", "id", &TraceOptions::default());
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["result"], "found-in-output");
        assert_eq!(json["success"], true);
        assert_eq!(json["nodes"][1]["type"], "table");
        assert_eq!(json["nodes"][1]["table"], "users");
        assert_eq!(json["edges"][0], serde_json::json!({"from": 1, "to": 0}));
        assert!(json.get("truncated").is_none());
    }
}
