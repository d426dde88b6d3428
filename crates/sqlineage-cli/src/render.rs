//! Text renderings of engine results
//!
//! JSON output is produced directly with serde_json; everything here is for
//! people (tree views, HTML, markdown, Mermaid).

use sqlineage_engine::{DiffResult, ColumnChanges, ImpactResult, NodeKind, TraceResult, TraceGraph};
use sqlineage_sql::{AnalyzeResult, CteListing, QualifyReport};
use std::collections::{BTreeSet, HashMap};

/// Entries shown before a list is cut with `... (+N more)`
const LIST_LIMIT: usize = 20;

/// Output columns shown in the summary view
const SUMMARY_COLUMNS: usize = 10;

fn cut(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let mut short: String = text.chars().take(max).collect();
        short.push_str("...");
        short
    } else {
        text.to_string()
    }
}

fn join_limited(items: &[String], limit: usize) -> String {
    let mut joined = items.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
    if items.len() > limit {
        joined.push_str(&format!(" ... (+{} more)", items.len() - limit));
    }
    joined
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Mermaid node id for a relation name
fn mermaid_id(name: &str) -> String {
    name.replace(['-', ' ', '.'], "_")
}

fn node_kind(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Table => "table",
        NodeKind::Derived => "derived",
        NodeKind::Subquery => "subquery",
        NodeKind::Ambiguous => "ambiguous",
    }
}

/// Trace result as an indented tree, root first
pub fn trace_tree(result: &TraceResult) -> String {
    match result {
        TraceResult::FoundInOutput(found) => {
            let mut lines = vec![format!("Column: {}", found.column), String::new()];
            if !found.graph.nodes.is_empty() {
                let children = children_of(&found.graph);
                tree_lines(&found.graph, &children, 0, 0, &mut lines);
            }
            if found.graph.truncated {
                lines.push(String::new());
                lines.push("(deeper nodes omitted)".to_string());
            }
            lines.join("\n")
        }
        TraceResult::FoundInCte(found) => {
            let mut lines = vec![
                format!("Column: {}", found.column),
                String::new(),
                "Not in final output; defined in:".to_string(),
            ];
            for found_in in &found.found_in {
                lines.push(format!("  CTE: {}", found_in.cte_name));
                lines.push(format!("    Expression: {}", found_in.expression));
                if !found_in.sources.is_empty() {
                    lines.push(format!("    Sources: {}", found_in.sources.join(", ")));
                }
                if let Some(graph) = &found_in.full_lineage {
                    if !graph.nodes.is_empty() {
                        let children = children_of(graph);
                        let mut nested = Vec::new();
                        tree_lines(graph, &children, 0, 0, &mut nested);
                        lines.extend(nested.into_iter().map(|line| format!("    {}", line)));
                    }
                }
            }
            lines.push(String::new());
            lines.push(format!("Available CTEs: {}", found.available_ctes.join(", ")));
            lines.join("\n")
        }
        TraceResult::NotFound(missing) => {
            format!("Column: {}\n\nError: {}\nHint: {}", missing.column, missing.error, missing.hint)
        }
        TraceResult::Failed(failure) => {
            format!("Column: {}\n\nError: {}\nHint: {}", failure.column, failure.error, failure.hint)
        }
    }
}

/// parent index -> child indexes
fn children_of(graph: &TraceGraph) -> HashMap<usize, Vec<usize>> {
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for edge in &graph.edges {
        children.entry(edge.to).or_default().push(edge.from);
    }
    children
}

fn tree_lines(
    graph: &TraceGraph,
    children: &HashMap<usize, Vec<usize>>,
    index: usize,
    level: usize,
    lines: &mut Vec<String>,
) {
    let Some(node) = graph.nodes.get(index) else {
        return;
    };

    let content = match (&node.kind, &node.table, &node.column) {
        (NodeKind::Table, Some(table), Some(column)) => format!("└── {}.{} (source table)", table, column),
        _ => format!(
            "└── {} ({})",
            node.expression.as_deref().unwrap_or(&node.name),
            node_kind(node.kind)
        ),
    };
    lines.push(format!("{}{}", "  ".repeat(level), content));

    for child in children.get(&index).map(Vec::as_slice).unwrap_or(&[]) {
        tree_lines(graph, children, *child, level + 1, lines);
    }
}

/// Self-contained page drawing the trace graph with vis-network
pub fn trace_html(result: &TraceResult) -> String {
    let found = match result {
        TraceResult::FoundInOutput(found) => found,
        TraceResult::FoundInCte(found) => {
            let items: Vec<String> = found
                .found_in
                .iter()
                .map(|m| format!("<li><b>{}</b>: <code>{}</code></li>", escape_html(&m.cte_name), escape_html(&m.expression)))
                .collect();
            return format!(
                "<html><body><h1>Column {} is not in the final output</h1><p>Defined in:</p><ul>{}</ul></body></html>",
                escape_html(&found.column),
                items.join("")
            );
        }
        TraceResult::NotFound(missing) => {
            return format!("<html><body><h1>Error</h1><p>{}</p></body></html>", escape_html(&missing.error));
        }
        TraceResult::Failed(failure) => {
            return format!("<html><body><h1>Error</h1><p>{}</p></body></html>", escape_html(&failure.error));
        }
    };

    let nodes: Vec<String> = found
        .graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let text = match (&node.table, &node.column) {
                (Some(table), Some(column)) => format!("{}.{}", table, column),
                _ => node.expression.clone().unwrap_or_else(|| "UNKNOWN".to_string()),
            };
            // A JSON string literal is a valid JS string literal
            let label = serde_json::to_string(&text).unwrap_or_else(|_| "\"UNKNOWN\"".to_string());
            let color = if node.kind == NodeKind::Table { "#97C2FC" } else { "#FB7E81" };
            format!("{{id: {}, label: {}, color: \"{}\"}}", i, label.replace("</", "<\\/"), color)
        })
        .collect();

    let edges: Vec<String> = found
        .graph
        .edges
        .iter()
        .map(|e| format!("{{from: {}, to: {}, arrows: \"to\"}}", e.from, e.to))
        .collect();

    let column = escape_html(&found.column);
    let tables = escape_html(&found.graph.source_tables.join(", "));

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Column Lineage: {column}</title>
    <script src="https://unpkg.com/vis-network/standalone/umd/vis-network.min.js"></script>
    <style>
        #graph {{ width: 100%; height: 600px; border: 1px solid #ccc; }}
        body {{ font-family: Arial, sans-serif; padding: 20px; }}
    </style>
</head>
<body>
    <h1>Lineage for column: {column}</h1>
    <p>Source tables: {tables}</p>
    <div id="graph"></div>
    <script>
        var nodes = new vis.DataSet([{nodes}]);
        var edges = new vis.DataSet([{edges}]);
        var container = document.getElementById('graph');
        var data = {{ nodes: nodes, edges: edges }};
        var options = {{ layout: {{ hierarchical: {{ direction: 'UD' }} }} }};
        new vis.Network(container, data, options);
    </script>
</body>
</html>"#,
        column = column,
        tables = tables,
        nodes = nodes.join(", "),
        edges = edges.join(", "),
    )
}

/// Impact report grouped into output and CTE columns
pub fn impact_tree(result: &ImpactResult) -> String {
    let report = match result {
        ImpactResult::Impacted(report) => report,
        ImpactResult::NotFound(failure) => {
            let mut lines = vec![
                format!("Error: {}", failure.error),
                format!("Hint: {}", failure.hint),
                String::new(),
                "Available sources:".to_string(),
            ];
            lines.extend(
                failure
                    .available_source_columns
                    .iter()
                    .take(LIST_LIMIT)
                    .map(|s| format!("  - {}", s)),
            );
            return lines.join("\n");
        }
    };

    let summary = &report.impact_summary;
    let mut lines = vec![
        format!("Impact Analysis for: {}", report.source_column),
        String::new(),
        format!("Summary: {} columns affected", summary.total_affected),
        format!("  - Output columns: {}", summary.output_columns_affected),
        format!("  - CTE columns: {}", summary.cte_columns_affected),
        String::new(),
    ];

    if !report.impacted_output_columns.is_empty() {
        lines.push("Impacted Output Columns:".to_string());
        for column in &report.impacted_output_columns {
            let hint = column.line_hint.map(|l| format!(" (line ~{})", l)).unwrap_or_default();
            lines.push(format!("  [{}] {}{}", column.position, column.column, hint));
            if let Some(expression) = column.expression.as_deref().filter(|e| !e.is_empty()) {
                lines.push(format!("      Expression: {}", cut(expression, 80)));
            }
            if let Some(branches) = &column.branches {
                let branches: Vec<String> = branches.iter().map(usize::to_string).collect();
                lines.push(format!("      UNION branches: {}", branches.join(", ")));
            }
        }
        lines.push(String::new());
    }

    if !report.impacted_cte_columns.is_empty() {
        lines.push("Impacted CTE Columns:".to_string());

        let mut current: Option<&str> = None;
        for column in &report.impacted_cte_columns {
            if current != Some(column.cte.as_str()) {
                let hint = column.line_hint.map(|l| format!(" (line ~{})", l)).unwrap_or_default();
                lines.push(format!("  CTE: {}{}", column.cte, hint));
                current = Some(&column.cte);
            }
            lines.push(format!("    - {}", column.column));
        }
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Diff as `+` added, `-` removed and `~` changed columns
pub fn diff_tree(result: &DiffResult) -> String {
    let summary = &result.diff_summary;
    let mut lines = vec![
        format!("Impact Diff for: {}", result.source_column),
        String::new(),
        format!(
            "Output columns: +{} -{} ~{}",
            summary.outputs_added, summary.outputs_removed, summary.outputs_changed
        ),
        format!(
            "CTE columns: +{} -{} ~{}",
            summary.ctes_added, summary.ctes_removed, summary.ctes_changed
        ),
    ];

    if result.is_empty() {
        lines.push(String::new());
        lines.push("No differences in impacted columns.".to_string());
        return lines.join("\n");
    }

    changes_lines("Output Columns:", &result.outputs, &mut lines);
    changes_lines("CTE Columns:", &result.ctes, &mut lines);
    lines.join("\n")
}

fn changes_lines(title: &str, changes: &ColumnChanges, lines: &mut Vec<String>) {
    if changes.is_empty() {
        return;
    }

    lines.push(String::new());
    lines.push(title.to_string());
    lines.extend(changes.added.iter().map(|name| format!("  + {}", name)));
    lines.extend(changes.removed.iter().map(|name| format!("  - {}", name)));
    for changed in &changes.changed {
        lines.push(format!("  ~ {}", changed.name));
        lines.push(format!("      old: {}", changed.old));
        lines.push(format!("      new: {}", changed.new));
    }
}

pub fn analyze_markdown(result: &AnalyzeResult) -> String {
    let mut lines = vec!["# SQL Analysis\n".to_string(), format!("**Query Type:** {}\n", result.query_type)];

    if !result.tables.is_empty() {
        lines.push("## Tables\n".to_string());
        for table in &result.tables {
            let alias = table.alias.as_ref().map(|a| format!(" (alias: {})", a)).unwrap_or_default();
            lines.push(format!("- `{}`{}", table.name, alias));
        }
        lines.push(String::new());
    }

    if !result.ctes.is_empty() {
        lines.push("## CTEs (Common Table Expressions)\n".to_string());
        for cte in &result.ctes {
            lines.push(format!("- **{}**: {}", cte.name, cte.columns.join(", ")));
        }
        lines.push(String::new());
    }

    if !result.columns.is_empty() {
        lines.push("## Output Columns\n".to_string());
        lines.push("| # | Name | Transformation | Sources | Expression |".to_string());
        lines.push("|---|------|----------------|---------|------------|".to_string());
        for column in &result.columns {
            let sources: Vec<String> = column.sources.iter().map(|s| format!("{}.{}", s.table, s.column)).collect();
            let expression: String = column.expression.chars().take(50).collect();
            lines.push(format!(
                "| {} | {} | {} | {} | `{}` |",
                column.output_position,
                column.output_name,
                column.transformation,
                sources.join(", "),
                expression
            ));
        }
        lines.push(String::new());
    }

    if !result.joins.is_empty() {
        lines.push("## Joins\n".to_string());
        for join in &result.joins {
            lines.push(format!(
                "- **{} JOIN** `{}` ON `{}`",
                join.join_type,
                join.table,
                join.condition.as_deref().unwrap_or("N/A")
            ));
        }
        lines.push(String::new());
    }

    if !result.filters.is_empty() {
        lines.push("## Filters (WHERE)\n".to_string());
        lines.extend(result.filters.iter().map(|f| format!("- `{}`", f)));
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Mermaid flowchart of which relations each CTE reads
pub fn cte_diagram(result: &AnalyzeResult) -> String {
    let mut lines = vec!["```mermaid".to_string(), "flowchart TD".to_string()];

    if result.ctes.is_empty() {
        lines.push("    no_ctes[No CTEs found]".to_string());
    } else {
        for cte in &result.ctes {
            for reference in &cte.references {
                lines.push(format!("    {} --> {}", mermaid_id(reference), mermaid_id(&cte.name)));
            }
        }

        let base_tables = base_tables(result);
        if !base_tables.is_empty() {
            lines.push("    classDef baseTable fill:#2d5a2d,stroke:#4a4a4a,color:#ffffff".to_string());
            for table in base_tables {
                lines.push(format!("    class {} baseTable", mermaid_id(&table)));
            }
        }
    }

    lines.push("```".to_string());
    lines.join("\n")
}

/// Relations CTEs read that are not CTEs themselves
fn base_tables(result: &AnalyzeResult) -> BTreeSet<String> {
    result
        .ctes
        .iter()
        .flat_map(|cte| cte.references.iter())
        .filter(|name| !result.ctes.iter().any(|cte| cte.name.eq_ignore_ascii_case(name)))
        .cloned()
        .collect()
}

/// Source tables, CTE chain and output columns
pub fn analyze_summary(result: &AnalyzeResult) -> String {
    let mut lines = vec!["# SQL Summary\n".to_string()];

    let sources: BTreeSet<&str> = result
        .tables
        .iter()
        .map(|t| t.name.as_str())
        .filter(|name| !result.ctes.iter().any(|cte| cte.name.eq_ignore_ascii_case(name)))
        .collect();

    if !sources.is_empty() {
        lines.push("## Source Tables\n".to_string());
        lines.extend(sources.iter().map(|t| format!("- {}", t)));
        lines.push(String::new());
    }

    if !result.ctes.is_empty() {
        lines.push("## CTE Chain\n".to_string());
        for cte in &result.ctes {
            if cte.references.is_empty() {
                lines.push(format!("- **{}**", cte.name));
            } else {
                lines.push(format!("- **{}** ← {}", cte.name, cte.references.join(", ")));
            }
        }
        lines.push(String::new());
    }

    if !result.columns.is_empty() {
        lines.push(format!("## Output ({} columns)\n", result.columns.len()));
        let names: Vec<&str> = result
            .columns
            .iter()
            .take(SUMMARY_COLUMNS)
            .map(|c| c.output_name.as_str())
            .collect();
        lines.push(names.join(", "));
        if result.columns.len() > SUMMARY_COLUMNS {
            lines.push(format!("... (+{} more)", result.columns.len() - SUMMARY_COLUMNS));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

pub fn ctes_text(listing: &CteListing) -> String {
    let mut lines = vec![format!("Found {} CTE(s):", listing.cte_count), String::new()];

    for cte in &listing.ctes {
        lines.push(format!("CTE: {}", cte.name));
        if !cte.columns.is_empty() {
            lines.push(format!("  Columns: {}", join_limited(&cte.columns, LIST_LIMIT)));
        }
        if !cte.references.is_empty() {
            lines.push(format!("  References: {}", cte.references.join(", ")));
        }
        lines.push(String::new());
    }

    if !listing.final_output_columns.is_empty() {
        lines.push(format!(
            "Final Output Columns: {}",
            join_limited(&listing.final_output_columns, LIST_LIMIT)
        ));
    }

    lines.join("\n")
}

/// One line per column reference, grouped by scope
pub fn qualify_text(report: &QualifyReport) -> String {
    let mut lines = vec![
        format!("Qualified: {}, Failed: {}", report.qualified, report.failed),
        String::new(),
    ];

    for scope in &report.scopes {
        if scope.references.is_empty() {
            continue;
        }

        lines.push(format!("Scope {} ({})", scope.label, scope.kind));
        for reference in &scope.references {
            let context = match &reference.output {
                Some(output) => format!("{} {}", reference.clause, output),
                None => reference.clause.to_string(),
            };
            match (&reference.resolved_to, &reference.error) {
                (Some(target), _) => lines.push(format!(
                    "  [{}] {} -> {} ({})",
                    context, reference.reference, target, reference.via
                )),
                (None, Some(error)) => {
                    lines.push(format!("  [{}] {} !! {}", context, reference.reference, error));
                    if let Some(hint) = &reference.hint {
                        lines.push(format!("      Hint: {}", hint));
                    }
                }
                (None, None) => lines.push(format!("  [{}] {}", context, reference.reference)),
            }
        }
        lines.push(String::new());
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlineage_core::Schema;
    use sqlineage_engine::{diff, impact, trace, DiffOptions, ImpactOptions, LineageQuery, TraceOptions};
    use sqlineage_sql::{analyze, list_ctes, AnalyzeOptions, SqlParser};

    const SQL: &str = "\
WITH base AS (
    SELECT id, amount FROM orders
),
scaled AS (
    SELECT id, amount * 2 AS doubled FROM base
)
SELECT s.id, s.doubled FROM scaled s";

    fn traced(sql: &str, column: &str) -> TraceResult {
        let schema = Schema::new();
        let query = LineageQuery::parse(&SqlParser::new(), sql, &schema).unwrap();
        trace(&query, column, &TraceOptions::default())
    }

    #[test]
    fn test_trace_tree_indents_by_depth() {
        let tree = trace_tree(&traced(SQL, "doubled"));
        let expected = "\
Column: doubled

└── s.doubled (derived)
  └── amount * 2 (derived)
    └── amount (derived)
      └── orders.amount (source table)";
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_trace_html_escapes_user_text() {
        let page = trace_html(&traced("SELECT '</script>' AS x FROM t", "x"));
        assert!(!page.contains("</script>\""));
        assert!(page.contains("vis-network"));
        assert!(page.contains("#FB7E81"));

        let missing = trace_html(&traced("SELECT a FROM t", "<b>"));
        assert!(missing.contains("&lt;b&gt;"));
    }

    #[test]
    fn test_impact_tree_layout() {
        let schema = Schema::new();
        let query = LineageQuery::parse(&SqlParser::new(), SQL, &schema).unwrap();
        let options = ImpactOptions { include_line_numbers: true, ..Default::default() };
        let result = impact(&query, "orders.amount", &options).unwrap();

        let expected = "\
Impact Analysis for: orders.amount

Summary: 3 columns affected
  - Output columns: 1
  - CTE columns: 2

Impacted Output Columns:
  [2] doubled (line ~7)
      Expression: s.doubled

Impacted CTE Columns:
  CTE: base (line ~1)
    - amount
  CTE: scaled (line ~4)
    - doubled";
        assert_eq!(impact_tree(&result), expected);
    }

    #[test]
    fn test_diff_tree_for_identical_queries() {
        let schema = Schema::new();
        let query = LineageQuery::parse(&SqlParser::new(), SQL, &schema).unwrap();
        let result = diff(&query, &query, "orders.amount", &DiffOptions::default()).unwrap();

        assert!(diff_tree(&result).ends_with("No differences in impacted columns."));
    }

    #[test]
    fn test_diagram_and_summary() {
        let parsed = SqlParser::new().parse(SQL).unwrap();
        let result = analyze(&parsed, &Schema::new(), &AnalyzeOptions::default()).unwrap();

        let diagram = cte_diagram(&result);
        assert!(diagram.starts_with("```mermaid\nflowchart TD"));
        assert!(diagram.contains("    orders --> base"));
        assert!(diagram.contains("    base --> scaled"));
        assert!(diagram.contains("    class orders baseTable"));
        assert!(!diagram.contains("class base baseTable"));

        let summary = analyze_summary(&result);
        assert!(summary.contains("## Source Tables\n\n- orders"));
        assert!(summary.contains("- **scaled** ← base"));
        assert!(summary.contains("## Output (2 columns)\n\nid, doubled"));
    }

    #[test]
    fn test_diagram_without_ctes() {
        let parsed = SqlParser::new().parse("SELECT id FROM users").unwrap();
        let result = analyze(&parsed, &Schema::new(), &AnalyzeOptions::default()).unwrap();
        assert_eq!(cte_diagram(&result), "```mermaid\nflowchart TD\n    no_ctes[No CTEs found]\n```");
    }

    #[test]
    fn test_ctes_text() {
        let parsed = SqlParser::new().parse(SQL).unwrap();
        let listing = list_ctes(&parsed, &Schema::new()).unwrap();

        let expected = "\
Found 2 CTE(s):

CTE: base
  Columns: id, amount
  References: orders

CTE: scaled
  Columns: id, doubled
  References: base

Final Output Columns: id, doubled";
        assert_eq!(ctes_text(&listing), expected);
    }

    #[test]
    fn test_cut_and_join_limited() {
        assert_eq!(cut("abcdef", 3), "abc...");
        assert_eq!(cut("abc", 3), "abc");

        let items: Vec<String> = (1..=4).map(|i| i.to_string()).collect();
        assert_eq!(join_limited(&items, 2), "1, 2 ... (+2 more)");
    }
}
