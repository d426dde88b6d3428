//! Scope builder
//!
//! Walks a parsed query depth-first and partitions it into a [`ScopeTree`].
//! CTEs are built before the scope that references them and may only see
//! CTEs declared earlier in the same WITH clause.

use sqlparser::ast::{
    Cte, Expr, GroupByExpr, JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr,
    TableFactor, With,
};
use sqlineage_core::{InferredType, LineageError, Schema};
use crate::expr::collect_parts;
use crate::inference;
use crate::scope::{
    Clause, ColumnDef, ColumnRef, OutputColumn, QualificationState, ScopeId, ScopeKind, ScopeTree,
    Source, SourceKind, Transformation,
};

/// Output name used for a `*` that cannot be expanded
pub const UNKNOWN_SOURCE: &str = "unknown_source";

/// Build the scope tree of `query`. Column references are left unqualified.
pub fn build_scopes(query: &Query, schema: &Schema) -> Result<ScopeTree, LineageError> {
    ScopeBuilder::new(schema).build(query)
}

/// CTE names visible while building one WITH clause
#[derive(Debug, Default)]
struct CteFrame {
    declared: Vec<(String, ScopeId)>,
    pending: Vec<String>,
    current: Option<String>,
    recursive: bool,
}

/// Depth-first scope builder
pub struct ScopeBuilder<'s> {
    schema: &'s Schema,
    tree: ScopeTree,
    frames: Vec<CteFrame>,
}

impl<'s> ScopeBuilder<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            tree: ScopeTree::default(),
            frames: Vec::new(),
        }
    }

    /// Build the tree; the root scope gets id 0
    pub fn build(mut self, query: &Query) -> Result<ScopeTree, LineageError> {
        let root = self.tree.alloc(ScopeKind::Root, None, None);
        self.fill_query(query, root)?;

        tracing::debug!(
            scopes = self.tree.len(),
            ctes = self.tree.iter().filter(|s| s.kind == ScopeKind::Cte).count(),
            outputs = self.tree.root().outputs.len(),
            "built scope tree"
        );

        Ok(self.tree)
    }

    fn build_query(
        &mut self,
        query: &Query,
        kind: ScopeKind,
        name: Option<String>,
        parent: ScopeId,
    ) -> Result<ScopeId, LineageError> {
        let id = self.tree.alloc(kind, name, Some(parent));
        self.fill_query(query, id)?;
        Ok(id)
    }

    fn fill_query(&mut self, query: &Query, id: ScopeId) -> Result<(), LineageError> {
        let has_frame = match &query.with {
            Some(with) => {
                self.declare_ctes(with, id)?;
                true
            }
            None => false,
        };

        self.fill_set_expr(&query.body, id)?;

        if has_frame {
            self.frames.pop();
        }

        Ok(())
    }

    fn declare_ctes(&mut self, with: &With, id: ScopeId) -> Result<(), LineageError> {
        self.frames.push(CteFrame {
            declared: Vec::new(),
            pending: with.cte_tables.iter().map(cte_name).collect(),
            current: None,
            recursive: with.recursive,
        });

        for cte in &with.cte_tables {
            let name = cte_name(cte);
            if let Some(frame) = self.frames.last_mut() {
                frame.current = Some(name.clone());
            }

            let cte_id = self.build_query(&cte.query, ScopeKind::Cte, Some(name.clone()), id)?;

            if let Some(frame) = self.frames.last_mut() {
                frame.current = None;
                if let Some(index) = frame.pending.iter().position(|p| p.eq_ignore_ascii_case(&name)) {
                    frame.pending.remove(index);
                }
                frame.declared.push((name, cte_id));
            }
            self.tree.scope_mut(id).ctes.push(cte_id);
        }

        Ok(())
    }

    /// Resolve a single-part relation name against the visible CTEs
    ///
    /// Outside `WITH RECURSIVE` a CTE body naming its own CTE reads the
    /// relation the CTE shadows, not itself.
    fn lookup_cte(&self, name: &str) -> Result<Option<(String, ScopeId)>, LineageError> {
        for frame in self.frames.iter().rev() {
            if let Some((declared, id)) = frame
                .declared
                .iter()
                .rev()
                .find(|(declared, _)| declared.eq_ignore_ascii_case(name))
            {
                return Ok(Some((declared.clone(), *id)));
            }

            if frame.pending.iter().any(|p| p.eq_ignore_ascii_case(name)) {
                let current = frame.current.clone().unwrap_or_default();
                let own_name = current.eq_ignore_ascii_case(name);
                if own_name && !frame.recursive {
                    continue;
                }
                if own_name {
                    return Err(LineageError::CycleDetected { node: current });
                }
                return Err(LineageError::ForwardReference {
                    cte: current,
                    name: name.to_string(),
                });
            }
        }

        Ok(None)
    }

    fn fill_set_expr(&mut self, body: &SetExpr, id: ScopeId) -> Result<(), LineageError> {
        match body {
            SetExpr::Select(select) => self.fill_select(select, id),
            SetExpr::Query(query) => self.fill_query(query, id),
            SetExpr::SetOperation { .. } => {
                let mut leaves = Vec::new();
                flatten_set_operation(body, &mut leaves);

                let mut branches = Vec::with_capacity(leaves.len());
                for leaf in leaves {
                    let branch = self.tree.alloc(ScopeKind::UnionBranch, None, Some(id));
                    self.fill_set_expr(leaf, branch)?;
                    branches.push(branch);
                }

                self.link_union(id, branches)
            }
            other => Err(LineageError::UnsupportedStatement(
                other
                    .to_string()
                    .split_whitespace()
                    .next()
                    .unwrap_or("query body")
                    .to_string(),
            )),
        }
    }

    /// Give a synthetic union parent the outputs of its first branch
    fn link_union(&mut self, id: ScopeId, branches: Vec<ScopeId>) -> Result<(), LineageError> {
        let Some(&first) = branches.first() else {
            return Ok(());
        };

        let any_star = branches
            .iter()
            .any(|b| self.tree.scope(*b).has_unresolved_star());

        if !any_star {
            let expected = self.tree.scope(first).outputs.len();
            for (index, branch) in branches.iter().enumerate().skip(1) {
                let found = self.tree.scope(*branch).outputs.len();
                if found != expected {
                    return Err(LineageError::UnionArity {
                        expected,
                        branch: index + 1,
                        found,
                    });
                }
            }
        }

        let outputs = self
            .tree
            .scope(first)
            .outputs
            .iter()
            .cloned()
            .map(|column| {
                let def = if column.is_unresolved_star() {
                    column.def.clone()
                } else {
                    ColumnDef::UnionOf(branches.clone())
                };
                OutputColumn { def, ..column }
            })
            .collect();

        tracing::debug!(scope = id, branches = branches.len(), "linked set operation");

        let scope = self.tree.scope_mut(id);
        scope.outputs = outputs;
        scope.branches = branches;
        Ok(())
    }

    fn fill_select(&mut self, select: &Select, id: ScopeId) -> Result<(), LineageError> {
        for table_with_joins in &select.from {
            self.add_table_factor(&table_with_joins.relation, id)?;

            for join in &table_with_joins.joins {
                self.add_table_factor(&join.relation, id)?;
                if let (_, Some(condition)) = join_parts(&join.join_operator) {
                    self.add_clause(Clause::Join, condition, id)?;
                }
            }
        }

        let group_by = group_by_exprs(&select.group_by);
        self.tree.scope_mut(id).group_by = group_by.iter().map(|e| e.to_string()).collect();

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.add_expr_column(expr, None, id)?,
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.add_expr_column(expr, Some(&alias.value), id)?
                }
                SelectItem::Wildcard(_) => self.expand_star(None, id),
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name
                        .0
                        .iter()
                        .map(|i| i.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".");
                    self.expand_star(Some(&qualifier), id)
                }
            }
        }

        if let Some(selection) = &select.selection {
            self.add_clause(Clause::Where, selection, id)?;
        }
        for expr in group_by {
            self.add_clause(Clause::GroupBy, expr, id)?;
        }
        if let Some(having) = &select.having {
            self.add_clause(Clause::Having, having, id)?;
        }
        if let Some(qualify) = &select.qualify {
            self.add_clause(Clause::Qualify, qualify, id)?;
        }

        Ok(())
    }

    fn add_table_factor(&mut self, factor: &TableFactor, id: ScopeId) -> Result<(), LineageError> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
                let alias = alias.as_ref().map(|a| a.name.value.clone());

                if let [single] = parts.as_slice() {
                    if let Some((cte, scope)) = self.lookup_cte(single)? {
                        self.push_source(id, Source {
                            alias,
                            kind: SourceKind::Cte { name: cte, scope },
                        });
                        return Ok(());
                    }
                }

                let Some(table) = parts.last().cloned() else {
                    return Ok(());
                };
                let n = parts.len();
                self.push_source(id, Source {
                    alias,
                    kind: SourceKind::Table {
                        name: table,
                        qualified_name: parts.join("."),
                        database: (n >= 2).then(|| parts[n - 2].clone()),
                        catalog: (n >= 3).then(|| parts[n - 3].clone()),
                    },
                });
            }
            TableFactor::Derived { lateral, subquery, alias } => {
                let alias = alias.as_ref().map(|a| a.name.value.clone());
                let child = self.build_query(subquery, ScopeKind::Subquery, alias.clone(), id)?;
                self.tree.scope_mut(child).derived = !lateral;
                self.push_source(id, Source {
                    alias,
                    kind: SourceKind::Subquery { scope: child },
                });
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.add_table_factor(&table_with_joins.relation, id)?;
                for join in &table_with_joins.joins {
                    self.add_table_factor(&join.relation, id)?;
                    if let (_, Some(condition)) = join_parts(&join.join_operator) {
                        self.add_clause(Clause::Join, condition, id)?;
                    }
                }
            }
            other => {
                tracing::debug!(relation = %other, "skipping relation without column lineage");
            }
        }

        Ok(())
    }

    fn push_source(&mut self, id: ScopeId, source: Source) {
        let scope = self.tree.scope_mut(id);
        if let Some(name) = source.reference_name() {
            let duplicate = scope
                .sources
                .iter()
                .any(|s| s.reference_name().is_some_and(|n| n.eq_ignore_ascii_case(name)));
            if duplicate {
                tracing::warn!(scope = id, name, "duplicate relation name in FROM clause");
            }
        }
        scope.sources.push(source);
    }

    fn add_expr_column(&mut self, expr: &Expr, alias: Option<&str>, id: ScopeId) -> Result<(), LineageError> {
        let position = self.tree.scope(id).outputs.len() + 1;
        let parts = collect_parts(expr);

        let mut subqueries = Vec::with_capacity(parts.subqueries.len());
        for query in parts.subqueries {
            subqueries.push(self.build_query(query, ScopeKind::Subquery, None, id)?);
        }

        let aggregation = inference::aggregation(expr);
        let group_by = &self.tree.scope(id).group_by;
        let grouped_by = (aggregation.is_some() && !group_by.is_empty()).then(|| group_by.clone());
        let data_type = inference::infer_type(expr, &|qualifier: Option<&str>, column: &str| {
            self.declared_type(id, qualifier, column)
        });

        let column = OutputColumn {
            position,
            name: alias
                .map(str::to_string)
                .unwrap_or_else(|| default_column_name(expr, position)),
            expression: expr.to_string(),
            def: ColumnDef::Expr {
                refs: parts.refs,
                subqueries,
            },
            state: QualificationState::Qualified,
            transformation: inference::classify(expr, alias),
            aggregation,
            grouped_by,
            data_type,
        };

        self.tree.scope_mut(id).outputs.push(column);
        Ok(())
    }

    /// Expand `*` / `qualifier.*` over the scope's sources. Sources without a
    /// known column list collapse into a single `unknown_source` column.
    fn expand_star(&mut self, qualifier: Option<&str>, id: ScopeId) {
        let sources: Vec<Source> = self
            .tree
            .scope(id)
            .sources
            .iter()
            .filter(|s| match qualifier {
                Some(q) => s.matches_alias(q) || s.matches_relation(q),
                None => true,
            })
            .cloned()
            .collect();

        let mut star_index = None;
        let mut unexpanded = Vec::new();

        if sources.is_empty() {
            if let Some(q) = qualifier {
                unexpanded.push(Some(q.to_string()));
            }
        }

        for source in &sources {
            let reference = source.reference_name().map(str::to_string);
            let columns: Option<Vec<(String, InferredType)>> = match &source.kind {
                SourceKind::Table { qualified_name, .. } => self.schema.table(qualified_name).map(|table| {
                    table
                        .column_names()
                        .into_iter()
                        .map(|c| {
                            let ty = table
                                .column_type(c)
                                .map(|t| InferredType::Declared(t.to_string()))
                                .unwrap_or(InferredType::Unknown);
                            (c.to_string(), ty)
                        })
                        .collect()
                }),
                SourceKind::Cte { scope, .. } | SourceKind::Subquery { scope } => {
                    let child = self.tree.scope(*scope);
                    if child.has_unresolved_star() {
                        None
                    } else {
                        Some(
                            child
                                .outputs
                                .iter()
                                .map(|c| (c.name.clone(), c.data_type.clone()))
                                .collect(),
                        )
                    }
                }
            };

            match columns {
                Some(columns) => {
                    for (name, data_type) in columns {
                        self.push_star_column(id, reference.as_deref(), name, data_type);
                    }
                }
                None => {
                    unexpanded.push(reference);
                    if star_index.is_none() {
                        star_index = Some(self.tree.scope(id).outputs.len());
                        self.push_unresolved_star(id, qualifier);
                    }
                }
            }
        }

        if sources.is_empty() && !unexpanded.is_empty() {
            self.push_unresolved_star(id, qualifier);
            star_index = Some(self.tree.scope(id).outputs.len() - 1);
        }

        if let Some(index) = star_index {
            let star_qualifier = match unexpanded.as_slice() {
                [Some(single)] => Some(single.clone()),
                _ => qualifier.map(str::to_string),
            };
            tracing::debug!(scope = id, sources = unexpanded.len(), "SELECT * left unexpanded (no schema)");
            if let Some(column) = self.tree.scope_mut(id).outputs.get_mut(index) {
                column.def = ColumnDef::UnresolvedStar {
                    qualifier: star_qualifier,
                };
            }
        }
    }

    fn push_star_column(&mut self, id: ScopeId, reference: Option<&str>, name: String, data_type: InferredType) {
        let scope = self.tree.scope_mut(id);
        let expression = match reference {
            Some(r) => format!("{}.{}", r, name),
            None => name.clone(),
        };
        scope.outputs.push(OutputColumn {
            position: scope.outputs.len() + 1,
            expression,
            def: ColumnDef::Expr {
                refs: vec![ColumnRef::new(reference.map(str::to_string), name.clone())],
                subqueries: Vec::new(),
            },
            name,
            state: QualificationState::Qualified,
            transformation: Transformation::Passthrough,
            aggregation: None,
            grouped_by: None,
            data_type,
        });
    }

    fn push_unresolved_star(&mut self, id: ScopeId, qualifier: Option<&str>) {
        let scope = self.tree.scope_mut(id);
        scope.outputs.push(OutputColumn {
            position: scope.outputs.len() + 1,
            name: UNKNOWN_SOURCE.to_string(),
            expression: match qualifier {
                Some(q) => format!("{}.*", q),
                None => "*".to_string(),
            },
            def: ColumnDef::UnresolvedStar {
                qualifier: qualifier.map(str::to_string),
            },
            state: QualificationState::UnresolvedStar,
            transformation: Transformation::Passthrough,
            aggregation: None,
            grouped_by: None,
            data_type: InferredType::Unknown,
        });
    }

    fn add_clause(&mut self, clause: Clause, expr: &Expr, id: ScopeId) -> Result<(), LineageError> {
        let parts = collect_parts(expr);
        for query in parts.subqueries {
            self.build_query(query, ScopeKind::Subquery, None, id)?;
        }

        let scope = self.tree.scope_mut(id);
        scope
            .clause_refs
            .extend(parts.refs.into_iter().map(|r| (clause, r)));
        Ok(())
    }

    /// Declared type of a column visible in `id`, from the schema or a child
    /// scope's inferred type
    fn declared_type(&self, id: ScopeId, qualifier: Option<&str>, column: &str) -> Option<String> {
        let scope = self.tree.scope(id);
        scope
            .sources
            .iter()
            .filter(|s| match qualifier {
                Some(q) => s.matches_alias(q) || s.matches_relation(q),
                None => true,
            })
            .find_map(|source| match &source.kind {
                SourceKind::Table { qualified_name, .. } => self
                    .schema
                    .column_type(qualified_name, column)
                    .map(str::to_string),
                SourceKind::Cte { scope, .. } | SourceKind::Subquery { scope } => {
                    match self.tree.scope(*scope).output(column).map(|c| &c.data_type) {
                        Some(InferredType::Declared(ty)) => Some(ty.clone()),
                        _ => None,
                    }
                }
            })
    }
}

fn cte_name(cte: &Cte) -> String {
    cte.alias.name.value.clone()
}

fn flatten_set_operation<'q>(expr: &'q SetExpr, out: &mut Vec<&'q SetExpr>) {
    match expr {
        SetExpr::SetOperation { left, right, .. } => {
            flatten_set_operation(left, out);
            flatten_set_operation(right, out);
        }
        other => out.push(other),
    }
}

/// Output name of an unaliased projection item
fn default_column_name(expr: &Expr, position: usize) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_else(|| format!("_col_{}", position - 1)),
        _ => format!("_col_{}", position - 1),
    }
}

/// GROUP BY expressions (`GROUP BY ALL` has none)
pub(crate) fn group_by_exprs(group_by: &GroupByExpr) -> Vec<&Expr> {
    match group_by {
        GroupByExpr::All(_) => Vec::new(),
        GroupByExpr::Expressions(exprs, _) => exprs.iter().collect(),
    }
}

/// Join type label and ON condition
pub(crate) fn join_parts(op: &JoinOperator) -> (&'static str, Option<&Expr>) {
    let (kind, constraint) = match op {
        JoinOperator::Inner(c) => ("INNER", Some(c)),
        JoinOperator::LeftOuter(c) => ("LEFT", Some(c)),
        JoinOperator::RightOuter(c) => ("RIGHT", Some(c)),
        JoinOperator::FullOuter(c) => ("FULL", Some(c)),
        JoinOperator::LeftSemi(c) => ("LEFT SEMI", Some(c)),
        JoinOperator::RightSemi(c) => ("RIGHT SEMI", Some(c)),
        JoinOperator::LeftAnti(c) => ("LEFT ANTI", Some(c)),
        JoinOperator::RightAnti(c) => ("RIGHT ANTI", Some(c)),
        JoinOperator::CrossJoin => ("CROSS", None),
        _ => ("OTHER", None),
    };

    let condition = match constraint {
        Some(JoinConstraint::On(expr)) => Some(expr),
        _ => None,
    };

    (kind, condition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlParser;
    use pretty_assertions::assert_eq;

    fn build(sql: &str) -> Result<ScopeTree, LineageError> {
        build_with(sql, &Schema::new())
    }

    fn build_with(sql: &str, schema: &Schema) -> Result<ScopeTree, LineageError> {
        let parsed = SqlParser::new().parse(sql).unwrap();
        let statement = parsed.lineage_statement().unwrap();
        build_scopes(statement.query, schema)
    }

    #[test]
    fn positions_are_sequential() {
        let tree = build("SELECT a, b + 1, c AS d, COUNT(*) FROM t GROUP BY a, b, c").unwrap();
        let root = tree.root();

        let positions: Vec<_> = root.outputs.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        assert_eq!(root.output_names(), vec!["a", "_col_1", "d", "_col_3"]);
        assert_eq!(root.group_by, vec!["a", "b", "c"]);
        assert_eq!(root.outputs[3].grouped_by, Some(vec!["a".to_string(), "b".to_string(), "c".to_string()]));
    }

    #[test]
    fn ctes_become_child_scopes_in_declaration_order() {
        let tree = build(
            "WITH step1 AS (SELECT amount FROM orders), \
             step2 AS (SELECT amount * 1.1 AS adjusted FROM step1) \
             SELECT adjusted FROM step2",
        )
        .unwrap();

        assert_eq!(tree.cte_names(), vec!["step1", "step2"]);
        let root = tree.root();
        assert_eq!(root.ctes.len(), 2);
        assert!(matches!(root.sources[0].kind, SourceKind::Cte { ref name, .. } if name == "step2"));

        let step2 = tree.scope(root.ctes[1]);
        assert_eq!(step2.kind, ScopeKind::Cte);
        assert_eq!(step2.parent, Some(ScopeTree::ROOT));
        assert!(matches!(step2.sources[0].kind, SourceKind::Cte { ref name, .. } if name == "step1"));
    }

    #[test]
    fn forward_reference_is_rejected() {
        let err = build(
            "WITH a AS (SELECT x FROM b), b AS (SELECT x FROM t) SELECT x FROM a",
        )
        .unwrap_err();

        assert_eq!(
            err,
            LineageError::ForwardReference { cte: "a".to_string(), name: "b".to_string() }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = build(
            "WITH RECURSIVE nums AS (SELECT 1 AS n UNION ALL SELECT n + 1 FROM nums) SELECT n FROM nums",
        )
        .unwrap_err();

        assert_eq!(err, LineageError::CycleDetected { node: "nums".to_string() });
    }

    #[test]
    fn cte_shadowing_its_own_table_reads_the_table() {
        let tree = build("WITH orders AS (SELECT id FROM orders) SELECT id FROM orders").unwrap();
        let root = tree.root();

        assert!(matches!(root.sources[0].kind, SourceKind::Cte { ref name, .. } if name == "orders"));
        let cte = tree.scope(root.ctes[0]);
        assert!(matches!(
            cte.sources[0].kind,
            SourceKind::Table { ref name, .. } if name == "orders"
        ));
    }

    #[test]
    fn union_arity_mismatch() {
        let err = build("SELECT a, b FROM t1 UNION ALL SELECT a, b, c FROM t2").unwrap_err();

        assert_eq!(err, LineageError::UnionArity { expected: 2, branch: 2, found: 3 });
    }

    #[test]
    fn union_parent_takes_first_branch_names() {
        let tree = build("SELECT id, name FROM a UNION SELECT uid, label FROM b UNION SELECT 1, 'x'").unwrap();
        let root = tree.root();

        assert_eq!(root.kind, ScopeKind::Root);
        assert_eq!(root.branches.len(), 3);
        assert_eq!(root.output_names(), vec!["id", "name"]);
        assert!(matches!(root.outputs[0].def, ColumnDef::UnionOf(ref b) if b.len() == 3));
        for branch in &root.branches {
            assert_eq!(tree.scope(*branch).kind, ScopeKind::UnionBranch);
        }
    }

    #[test]
    fn star_without_schema_is_unknown_source() {
        let tree = build("SELECT * FROM users JOIN orders ON users.id = orders.user_id").unwrap();
        let root = tree.root();

        assert_eq!(root.output_names(), vec![UNKNOWN_SOURCE]);
        assert_eq!(root.outputs[0].state, QualificationState::UnresolvedStar);
        assert!(matches!(root.outputs[0].def, ColumnDef::UnresolvedStar { qualifier: None }));
        assert_eq!(root.clause_refs.len(), 2);
    }

    #[test]
    fn star_with_schema_expands_in_order() {
        let schema = Schema::new()
            .with_table("users", [("id", "INT"), ("email", "VARCHAR")]);
        let tree = build_with("SELECT * FROM users u JOIN orders o ON u.id = o.user_id", &schema).unwrap();
        let root = tree.root();

        assert_eq!(root.output_names(), vec!["id", "email", UNKNOWN_SOURCE]);
        assert_eq!(root.outputs[1].expression, "u.email");
        assert_eq!(root.outputs[1].data_type, InferredType::Declared("VARCHAR".to_string()));
        assert!(matches!(
            root.outputs[2].def,
            ColumnDef::UnresolvedStar { qualifier: Some(ref q) } if q == "o"
        ));
    }

    #[test]
    fn star_over_cte_uses_cte_outputs() {
        let tree = build("WITH c AS (SELECT a, b AS bee FROM t) SELECT c.* FROM c").unwrap();
        assert_eq!(tree.root().output_names(), vec!["a", "bee"]);
        assert_eq!(tree.root().outputs[1].expression, "c.bee");
    }

    #[test]
    fn expression_subqueries_are_child_scopes() {
        let tree = build(
            "SELECT id, (SELECT MAX(total) FROM orders o WHERE o.user_id = u.id) AS top \
             FROM users u WHERE u.id IN (SELECT user_id FROM vip)",
        )
        .unwrap();

        let subqueries: Vec<_> = tree
            .iter()
            .filter(|s| s.kind == ScopeKind::Subquery)
            .collect();
        assert_eq!(subqueries.len(), 2);
        assert!(subqueries.iter().all(|s| s.parent == Some(ScopeTree::ROOT)));
        assert!(matches!(
            tree.root().outputs[1].def,
            ColumnDef::Expr { ref subqueries, .. } if subqueries.len() == 1
        ));
    }

    #[test]
    fn derived_table_source() {
        let tree = build("SELECT id AS user_id FROM (SELECT id FROM users) t").unwrap();
        let root = tree.root();

        assert_eq!(root.sources[0].alias.as_deref(), Some("t"));
        let child = root.sources[0].scope().unwrap();
        assert_eq!(tree.scope(child).kind, ScopeKind::Subquery);
        assert_eq!(tree.label(child).as_deref(), Some("t"));
        assert_eq!(root.outputs[0].transformation, Transformation::Renamed);
    }

    #[test]
    fn qualified_table_names_are_split() {
        let tree = build("SELECT o.id FROM prod.sales.orders o").unwrap();
        match &tree.root().sources[0].kind {
            SourceKind::Table { name, qualified_name, database, catalog } => {
                assert_eq!(name, "orders");
                assert_eq!(qualified_name, "prod.sales.orders");
                assert_eq!(database.as_deref(), Some("sales"));
                assert_eq!(catalog.as_deref(), Some("prod"));
            }
            other => panic!("unexpected source {:?}", other),
        }
    }
}
