//! Structural query reports
//!
//! `analyze` describes tables, CTEs, output columns, joins, filters and
//! aggregations of a query. `list_ctes`, `extract_tables` and
//! `qualify_report` are narrower views over the same qualified scope tree.

use serde::Serialize;
use sqlparser::ast::{Expr, Query, Select, SelectItem, SetExpr, TableFactor};
use sqlineage_core::{
    Diagnostic, DiagnosticCode, DialectConfig, InferredType, LineageError, Schema, Severity,
    SeverityThreshold,
};
use crate::builder::{group_by_exprs, join_parts};
use crate::expr::{self, collect_parts};
use crate::inference;
use crate::parser::{ParsedSql, StatementKind};
use crate::qualify::build_qualified_scopes;
use crate::scope::{
    AggregationInfo, ColumnDef, ColumnTarget, Resolution, ScopeId, ScopeKind, ScopeTree, SourceKind,
    Transformation,
};

/// Cut `expr` to `max_length` characters and append `...`. Zero disables.
pub fn truncate_expr(expr: &str, max_length: Option<usize>) -> String {
    match max_length {
        Some(max) if max > 0 && expr.chars().count() > max => {
            let mut cut: String = expr.chars().take(max).collect();
            cut.push_str("...");
            cut
        }
        _ => expr.to_string(),
    }
}

/// Kind of statement analyzed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Select,
    CreateTableAsSelect,
    InsertSelect,
    Union,
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Select => write!(f, "SELECT"),
            Self::CreateTableAsSelect => write!(f, "CREATE_TABLE_AS_SELECT"),
            Self::InsertSelect => write!(f, "INSERT_SELECT"),
            Self::Union => write!(f, "UNION"),
        }
    }
}

/// Options shared by the structural reports
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub max_expr_length: Option<usize>,
    pub severity: SeverityThreshold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CteInfo {
    pub name: String,
    pub columns: Vec<String>,

    /// Tables and CTEs read anywhere inside the CTE body
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceColumn {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub output_position: usize,
    pub output_name: String,
    pub expression: String,
    pub transformation: Transformation,
    pub sources: Vec<SourceColumn>,
    pub data_type: InferredType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouped_by: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinInfo {
    #[serde(rename = "type")]
    pub join_type: String,
    pub table: String,
    pub condition: Option<String>,
}

/// Full structural analysis of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzeResult {
    pub success: bool,
    pub query_type: QueryType,
    pub dialect: DialectConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    pub tables: Vec<TableRef>,
    pub ctes: Vec<CteInfo>,
    pub columns: Vec<ColumnInfo>,
    pub joins: Vec<JoinInfo>,
    pub filters: Vec<String>,
    pub group_by: Vec<String>,
    pub order_by: Vec<String>,
    pub aggregations: Vec<String>,
    pub window_functions: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AnalyzeResult {
    /// Base tables, excluding names that are CTEs
    pub fn source_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .tables
            .iter()
            .filter(|t| !self.ctes.iter().any(|c| c.name.eq_ignore_ascii_case(&t.name)))
            .map(|t| t.name.clone())
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }
}

/// Analyze the first statement of `parsed`
pub fn analyze(parsed: &ParsedSql, schema: &Schema, options: &AnalyzeOptions) -> Result<AnalyzeResult, LineageError> {
    let statement = parsed.lineage_statement()?;
    let tree = build_qualified_scopes(statement.query, schema)?;
    let root = tree.root();

    let query_type = match statement.kind {
        StatementKind::Select if root.is_union() => QueryType::Union,
        StatementKind::Select => QueryType::Select,
        StatementKind::CreateTableAsSelect => QueryType::CreateTableAsSelect,
        StatementKind::InsertSelect => QueryType::InsertSelect,
    };

    let columns = root
        .outputs
        .iter()
        .map(|column| ColumnInfo {
            output_position: column.position,
            output_name: column.name.clone(),
            expression: truncate_expr(&column.expression, options.max_expr_length),
            transformation: column.transformation,
            sources: column_sources(&tree, ScopeTree::ROOT, column.position),
            data_type: column.data_type.clone(),
            aggregation: column.aggregation.clone(),
            grouped_by: column.grouped_by.clone(),
        })
        .collect();

    let mut selects = Vec::new();
    collect_selects(statement.query, &mut selects);

    let mut top_level = Vec::new();
    collect_body_selects(&statement.query.body, &mut top_level);

    let filters = top_level
        .iter()
        .filter_map(|s| s.selection.as_ref())
        .map(|e| e.to_string())
        .collect();

    let group_by = std::iter::once(ScopeTree::ROOT)
        .chain(root.branches.iter().copied())
        .map(|id| &tree.scope(id).group_by)
        .find(|g| !g.is_empty())
        .cloned()
        .unwrap_or_default();

    let order_by = statement
        .query
        .order_by
        .as_ref()
        .map(|o| o.exprs.iter().map(|e| e.to_string()).collect())
        .unwrap_or_default();

    let (aggregations, window_functions) = function_calls(&selects);

    let mut tables = Vec::new();
    for scope in tree.iter() {
        for source in &scope.sources {
            if let SourceKind::Table { name, database, .. } = &source.kind {
                let table = TableRef {
                    name: name.clone(),
                    alias: source.alias.clone(),
                    schema: database.clone(),
                };
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
        }
    }

    let result = AnalyzeResult {
        success: true,
        query_type,
        dialect: parsed.dialect,
        target_table: statement.target_table.clone(),
        tables,
        ctes: cte_infos(&tree),
        columns,
        joins: joins(&selects),
        filters,
        group_by,
        order_by,
        aggregations,
        window_functions,
        diagnostics: diagnostics(&tree, &options.severity),
    };

    tracing::debug!(
        columns = result.columns.len(),
        tables = result.tables.len(),
        ctes = result.ctes.len(),
        "analyzed query"
    );

    Ok(result)
}

/// Source columns of an output column, following lateral aliases and
/// every UNION branch
pub fn column_sources(tree: &ScopeTree, scope: ScopeId, position: usize) -> Vec<SourceColumn> {
    let mut sources = Vec::new();
    let mut visiting = Vec::new();
    gather_sources(tree, scope, position, &mut visiting, &mut sources);
    sources
}

fn gather_sources(
    tree: &ScopeTree,
    scope: ScopeId,
    position: usize,
    visiting: &mut Vec<(ScopeId, usize)>,
    out: &mut Vec<SourceColumn>,
) {
    if visiting.contains(&(scope, position)) {
        return;
    }
    visiting.push((scope, position));

    let Some(column) = tree.scope(scope).output_at(position) else {
        return;
    };

    match &column.def {
        ColumnDef::UnionOf(branches) => {
            for branch in branches {
                gather_sources(tree, *branch, position, visiting, out);
            }
        }
        ColumnDef::UnresolvedStar { qualifier } => push_source(
            out,
            qualifier.clone().unwrap_or_else(|| "unknown".to_string()),
            "*".to_string(),
        ),
        ColumnDef::Expr { refs, .. } => {
            for column_ref in refs {
                match &column_ref.resolution {
                    Resolution::Resolved(resolved) => match &resolved.target {
                        ColumnTarget::Table { table, column } => push_source(out, table.clone(), column.clone()),
                        ColumnTarget::Scope { scope: child, column, .. } => push_source(
                            out,
                            tree.label(*child).unwrap_or_else(|| "subquery".to_string()),
                            column.clone(),
                        ),
                        ColumnTarget::Lateral { position } => {
                            gather_sources(tree, resolved.scope, *position, visiting, out)
                        }
                    },
                    _ => push_source(
                        out,
                        column_ref.qualifier.clone().unwrap_or_else(|| "unknown".to_string()),
                        column_ref.column.clone(),
                    ),
                }
            }
        }
    }
}

fn push_source(out: &mut Vec<SourceColumn>, table: String, column: String) {
    let source = SourceColumn { table, column };
    if !out.contains(&source) {
        out.push(source);
    }
}

fn cte_infos(tree: &ScopeTree) -> Vec<CteInfo> {
    tree.ctes_breadth_first()
        .into_iter()
        .map(|id| {
            let scope = tree.scope(id);
            let mut references: Vec<String> = Vec::new();
            for inner in tree.iter().filter(|s| is_within(tree, s.id, id)) {
                for source in &inner.sources {
                    if let Some(name) = source.relation_name() {
                        if !references.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                            references.push(name.to_string());
                        }
                    }
                }
            }

            CteInfo {
                name: scope.name.clone().unwrap_or_default(),
                columns: scope.output_names(),
                references,
            }
        })
        .collect()
}

/// Whether `id` is `ancestor` or nested inside it
fn is_within(tree: &ScopeTree, id: ScopeId, ancestor: ScopeId) -> bool {
    let mut current = Some(id);
    while let Some(scope) = current {
        if scope == ancestor {
            return true;
        }
        current = tree.scope(scope).parent;
    }
    false
}

fn diagnostics(tree: &ScopeTree, severity: &SeverityThreshold) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for scope in tree.iter() {
        // a union parent repeats its first branch's star
        if scope.is_union() {
            continue;
        }
        for column in scope.outputs.iter().filter(|c| c.is_unresolved_star()) {
            let over = match &column.def {
                ColumnDef::UnresolvedStar { qualifier: Some(q) } => format!("'{}'", q),
                _ => "sources without a schema".to_string(),
            };
            let where_ = tree.label(scope.id).unwrap_or_else(|| "final SELECT".to_string());
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::SelectStarUnexpandable,
                    severity.get_severity(DiagnosticCode::SelectStarUnexpandable, Severity::Warn),
                    format!("{} in {} cannot be expanded over {}", column.expression, where_, over),
                )
                .with_hint("Provide a schema with --schema to expand SELECT *."),
            );
        }
    }

    for (_, column_ref) in tree.all_refs() {
        if let Resolution::Failed(err) = &column_ref.resolution {
            let mut diagnostic = err.to_diagnostic();
            diagnostic.severity = severity.get_severity(err.code(), diagnostic.severity);
            if !diagnostics.contains(&diagnostic) {
                diagnostics.push(diagnostic);
            }
        }
    }

    diagnostics
}

/// Every SELECT in the query: CTE bodies, set operation branches, derived
/// tables and expression subqueries
fn collect_selects<'q>(query: &'q Query, out: &mut Vec<&'q Select>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_selects(&cte.query, out);
        }
    }
    collect_set_expr(&query.body, out);
}

fn collect_set_expr<'q>(body: &'q SetExpr, out: &mut Vec<&'q Select>) {
    match body {
        SetExpr::Select(select) => {
            out.push(select.as_ref());
            for table in &select.from {
                collect_factor(&table.relation, out);
                for join in &table.joins {
                    collect_factor(&join.relation, out);
                }
            }
            for expr in select_exprs(select) {
                for query in collect_parts(expr).subqueries {
                    collect_selects(query, out);
                }
            }
        }
        SetExpr::Query(query) => collect_selects(query, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, out);
            collect_set_expr(right, out);
        }
        _ => {}
    }
}

fn collect_factor<'q>(factor: &'q TableFactor, out: &mut Vec<&'q Select>) {
    match factor {
        TableFactor::Derived { subquery, .. } => collect_selects(subquery, out),
        TableFactor::NestedJoin { table_with_joins, .. } => {
            collect_factor(&table_with_joins.relation, out);
            for join in &table_with_joins.joins {
                collect_factor(&join.relation, out);
            }
        }
        _ => {}
    }
}

/// SELECTs of the statement body itself, one per set operation branch
fn collect_body_selects<'q>(body: &'q SetExpr, out: &mut Vec<&'q Select>) {
    match body {
        SetExpr::Select(select) => out.push(select.as_ref()),
        SetExpr::Query(query) => collect_body_selects(&query.body, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_body_selects(left, out);
            collect_body_selects(right, out);
        }
        _ => {}
    }
}

/// Expressions of a SELECT outside its FROM clause
fn select_exprs(select: &Select) -> Vec<&Expr> {
    let mut exprs: Vec<&Expr> = select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
            _ => None,
        })
        .collect();
    exprs.extend(select.selection.as_ref());
    exprs.extend(group_by_exprs(&select.group_by));
    exprs.extend(select.having.as_ref());
    exprs.extend(select.qualify.as_ref());
    exprs
}

fn joins(selects: &[&Select]) -> Vec<JoinInfo> {
    selects
        .iter()
        .flat_map(|select| select.from.iter())
        .flat_map(|table| table.joins.iter())
        .map(|join| {
            let (join_type, condition) = join_parts(&join.join_operator);
            let table = match &join.relation {
                TableFactor::Table { name, .. } => name
                    .0
                    .last()
                    .map(|ident| ident.value.clone())
                    .unwrap_or_else(|| name.to_string()),
                other => other.to_string(),
            };
            JoinInfo {
                join_type: join_type.to_string(),
                table,
                condition: condition.map(|c| c.to_string()),
            }
        })
        .collect()
}

/// Aggregate and window function calls in projections, HAVING and QUALIFY
fn function_calls(selects: &[&Select]) -> (Vec<String>, Vec<String>) {
    let mut aggregations = Vec::new();
    let mut windows = Vec::new();

    for select in selects {
        let exprs = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
                _ => None,
            })
            .chain(select.having.as_ref())
            .chain(select.qualify.as_ref());

        for root in exprs {
            expr::walk(root, &mut |node| {
                if let Expr::Function(func) = node {
                    if func.over.is_some() {
                        windows.push(node.to_string());
                    } else if inference::is_aggregate(func) {
                        aggregations.push(node.to_string());
                    }
                }
                true
            });
        }
    }

    (aggregations, windows)
}

/// CTE listing with the final output columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CteListing {
    pub success: bool,
    pub cte_count: usize,
    pub ctes: Vec<CteInfo>,
    pub final_output_columns: Vec<String>,
}

pub fn list_ctes(parsed: &ParsedSql, schema: &Schema) -> Result<CteListing, LineageError> {
    let statement = parsed.lineage_statement()?;
    let tree = build_qualified_scopes(statement.query, schema)?;
    let ctes = cte_infos(&tree);

    Ok(CteListing {
        success: true,
        cte_count: ctes.len(),
        ctes,
        final_output_columns: tree.root().output_names(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub database: Option<String>,
    pub catalog: Option<String>,
    pub alias: Option<String>,
    pub qualified_name: String,
}

/// Every base table read by a statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableListing {
    pub success: bool,
    pub tables: Vec<TableInfo>,
}

impl TableListing {
    /// Distinct table names in first-seen order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for table in &self.tables {
            if !names.contains(&table.name.as_str()) {
                names.push(&table.name);
            }
        }
        names
    }
}

pub fn extract_tables(parsed: &ParsedSql) -> Result<TableListing, LineageError> {
    let statement = parsed.lineage_statement()?;
    let tree = crate::builder::build_scopes(statement.query, &Schema::new())?;

    let tables = tree
        .iter()
        .flat_map(|scope| scope.sources.iter())
        .filter_map(|source| match &source.kind {
            SourceKind::Table { name, qualified_name, database, catalog } => Some(TableInfo {
                name: name.clone(),
                database: database.clone(),
                catalog: catalog.clone(),
                alias: source.alias.clone(),
                qualified_name: qualified_name.clone(),
            }),
            _ => None,
        })
        .collect();

    Ok(TableListing { success: true, tables })
}

/// How one column reference was qualified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualifiedRef {
    /// `select` for projection references, otherwise the clause
    pub clause: &'static str,

    /// Output column the reference feeds, for projection references
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    pub reference: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_to: Option<String>,

    /// `table`, `cte`, `subquery`, `union_branch`, `lateral`, or the
    /// diagnostic code of the failure
    pub via: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeReport {
    pub scope: ScopeId,
    pub kind: ScopeKind,
    pub label: String,
    pub references: Vec<QualifiedRef>,
}

/// Qualification outcome of every column reference, per scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualifyReport {
    pub success: bool,
    pub qualified: usize,
    pub failed: usize,
    pub scopes: Vec<ScopeReport>,
}

pub fn qualify_report(parsed: &ParsedSql, schema: &Schema) -> Result<QualifyReport, LineageError> {
    let statement = parsed.lineage_statement()?;
    let tree = build_qualified_scopes(statement.query, schema)?;

    let mut qualified = 0;
    let mut failed = 0;
    let mut scopes = Vec::new();

    for scope in tree.iter() {
        let projection = scope
            .outputs
            .iter()
            .flat_map(|c| c.refs().iter().map(move |r| ("select", Some(c.name.clone()), r)));
        let clauses = scope
            .clause_refs
            .iter()
            .map(|(clause, r)| (clause.as_str(), None, r));

        let references: Vec<QualifiedRef> = projection
            .chain(clauses)
            .map(|(clause, output, column_ref)| {
                let mut entry = QualifiedRef {
                    clause,
                    output,
                    reference: column_ref.display_name(),
                    resolved_to: None,
                    via: String::new(),
                    error: None,
                    hint: None,
                };
                match &column_ref.resolution {
                    Resolution::Resolved(resolved) => {
                        qualified += 1;
                        let (target, via) = describe_target(&tree, resolved.scope, &resolved.target);
                        entry.resolved_to = Some(target);
                        entry.via = via.to_string();
                    }
                    Resolution::Failed(err) => {
                        failed += 1;
                        entry.via = err.code().as_str().to_string();
                        entry.error = Some(err.to_string());
                        entry.hint = Some(err.hint());
                    }
                    Resolution::Pending => entry.via = "pending".to_string(),
                }
                entry
            })
            .collect();

        if references.is_empty() {
            continue;
        }

        scopes.push(ScopeReport {
            scope: scope.id,
            kind: scope.kind,
            label: tree.label(scope.id).unwrap_or_else(|| "final".to_string()),
            references,
        });
    }

    Ok(QualifyReport {
        success: failed == 0,
        qualified,
        failed,
        scopes,
    })
}

/// Rendered target of a resolution and the kind of source it went through
pub fn describe_target(tree: &ScopeTree, owner: ScopeId, target: &ColumnTarget) -> (String, &'static str) {
    match target {
        ColumnTarget::Table { table, column } => (format!("{}.{}", table, column), "table"),
        ColumnTarget::Scope { scope, column, .. } => {
            let label = tree.label(*scope).unwrap_or_else(|| "subquery".to_string());
            let via = match tree.scope(*scope).kind {
                ScopeKind::Cte => "cte",
                ScopeKind::UnionBranch => "union_branch",
                _ => "subquery",
            };
            (format!("{}.{}", label, column), via)
        }
        ColumnTarget::Lateral { position } => {
            let name = tree
                .scope(owner)
                .output_at(*position)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| format!("#{}", position));
            (name, "lateral")
        }
    }
}
