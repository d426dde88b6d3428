//! Column qualification
//!
//! Resolves every column reference in a scope tree to a concrete source.
//! Qualified references match aliases first, then raw relation names.
//! Unqualified references prefer sources that definitely provide the column
//! (a table whose schema declares it, or a CTE / derived table that outputs
//! it), then explicit aliases of earlier output columns, then sources whose
//! columns are unknown. Only subqueries look at enclosing scopes.

use sqlparser::ast::Query;
use sqlineage_core::{LineageError, Schema};
use crate::builder::build_scopes;
use crate::scope::{
    ColumnDef, ColumnRef, ColumnTarget, QualificationState, Resolution, ResolvedColumn, ScopeId,
    ScopeKind, ScopeTree, SourceKind, Transformation,
};

/// Which earlier output columns an unqualified reference may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lateral {
    /// Output aliases are not visible
    None,

    /// Aliases of output columns before this 1-based position
    Before(usize),

    /// Any output alias (GROUP BY, HAVING)
    Any,
}

/// Resolves column references against a built scope tree
pub struct Qualifier<'a> {
    tree: &'a ScopeTree,
    schema: &'a Schema,
}

impl<'a> Qualifier<'a> {
    pub fn new(tree: &'a ScopeTree, schema: &'a Schema) -> Self {
        Self { tree, schema }
    }

    /// Qualify a reference appearing in `scope`
    pub fn qualify(&self, scope: ScopeId, column_ref: &ColumnRef) -> Result<ResolvedColumn, LineageError> {
        self.resolve(scope, column_ref.qualifier.as_deref(), &column_ref.column, Lateral::None)
    }

    pub fn resolve(
        &self,
        scope: ScopeId,
        qualifier: Option<&str>,
        column: &str,
        lateral: Lateral,
    ) -> Result<ResolvedColumn, LineageError> {
        match qualifier {
            Some(qualifier) => self.resolve_qualified(scope, qualifier, column),
            None => self.resolve_unqualified(scope, column, lateral),
        }
    }

    fn resolve_qualified(&self, scope: ScopeId, qualifier: &str, column: &str) -> Result<ResolvedColumn, LineageError> {
        let mut current = Some(scope);

        while let Some(id) = current {
            let sources = &self.tree.scope(id).sources;
            let hit = sources
                .iter()
                .position(|s| s.matches_alias(qualifier))
                .or_else(|| sources.iter().position(|s| s.matches_relation(qualifier)));

            if let Some(index) = hit {
                return self.target_in_source(id, index, column);
            }
            current = self.correlation_parent(id);
        }

        Err(LineageError::UnknownTable {
            qualifier: qualifier.to_string(),
            reference: format!("{}.{}", qualifier, column),
            available: self.visible_names(scope),
        })
    }

    fn resolve_unqualified(&self, scope: ScopeId, column: &str, lateral: Lateral) -> Result<ResolvedColumn, LineageError> {
        let mut current = Some(scope);

        while let Some(id) = current {
            let current_scope = self.tree.scope(id);
            let mut definite = Vec::new();
            let mut opaque = Vec::new();

            for (index, source) in current_scope.sources.iter().enumerate() {
                match &source.kind {
                    SourceKind::Table { qualified_name, .. } => match self.schema.table(qualified_name) {
                        Some(table) if table.declares(column) => definite.push(index),
                        Some(_) => {}
                        None => opaque.push(index),
                    },
                    SourceKind::Cte { scope: child, .. } | SourceKind::Subquery { scope: child } => {
                        let child = self.tree.scope(*child);
                        if child.output(column).is_some() {
                            definite.push(index);
                        } else if child.has_unresolved_star() {
                            opaque.push(index);
                        }
                    }
                }
            }

            if definite.len() == 1 {
                return self.target_in_source(id, definite[0], column);
            }
            if definite.len() > 1 {
                return Err(self.ambiguous(id, column, &definite));
            }

            if id == scope {
                if let Some(position) = self.lateral_alias(id, column, lateral) {
                    return Ok(ResolvedColumn {
                        scope: id,
                        source: None,
                        target: ColumnTarget::Lateral { position },
                    });
                }
            }

            if opaque.len() == 1 {
                return self.target_in_source(id, opaque[0], column);
            }
            if opaque.len() > 1 {
                return Err(self.ambiguous(id, column, &opaque));
            }

            current = self.correlation_parent(id);
        }

        Err(LineageError::ColumnNotFound {
            column: column.to_string(),
            searched: self.visible_names(scope),
        })
    }

    /// Resolve a column that a scope only exposes through an unexpanded `*`.
    /// A UNION scope yields one resolution per branch.
    pub fn resolve_behind_star(&self, scope: ScopeId, column: &str) -> Vec<Result<ResolvedColumn, LineageError>> {
        let target = self.tree.scope(scope);

        if target.is_union() {
            return target
                .branches
                .iter()
                .flat_map(|branch| self.resolve_behind_star(*branch, column))
                .collect();
        }

        let qualifiers: Vec<Option<&str>> = target
            .outputs
            .iter()
            .filter_map(|c| match &c.def {
                ColumnDef::UnresolvedStar { qualifier } => Some(qualifier.as_deref()),
                _ => None,
            })
            .collect();

        let result = match qualifiers.as_slice() {
            [Some(qualifier)] => self.resolve_qualified(scope, qualifier, column),
            _ => self.resolve_unqualified(scope, column, Lateral::None),
        };
        vec![result]
    }

    fn target_in_source(&self, owner: ScopeId, index: usize, column: &str) -> Result<ResolvedColumn, LineageError> {
        let source = &self.tree.scope(owner).sources[index];

        let target = match &source.kind {
            SourceKind::Table { qualified_name, .. } => {
                let column = self
                    .schema
                    .table(qualified_name)
                    .and_then(|t| t.column_names().into_iter().find(|c| c.eq_ignore_ascii_case(column)))
                    .unwrap_or(column);
                ColumnTarget::Table {
                    table: qualified_name.clone(),
                    column: column.to_string(),
                }
            }
            SourceKind::Cte { scope, .. } | SourceKind::Subquery { scope } => {
                let child = self.tree.scope(*scope);
                match child.output(column) {
                    Some(output) => ColumnTarget::Scope {
                        scope: *scope,
                        position: Some(output.position),
                        column: output.name.clone(),
                    },
                    None if child.has_unresolved_star() => ColumnTarget::Scope {
                        scope: *scope,
                        position: None,
                        column: column.to_string(),
                    },
                    None => {
                        return Err(LineageError::ColumnNotFound {
                            column: match source.reference_name() {
                                Some(name) => format!("{}.{}", name, column),
                                None => column.to_string(),
                            },
                            searched: child.output_names(),
                        })
                    }
                }
            }
        };

        Ok(ResolvedColumn {
            scope: owner,
            source: Some(index),
            target,
        })
    }

    /// Explicit alias of an earlier output column
    fn lateral_alias(&self, scope: ScopeId, column: &str, lateral: Lateral) -> Option<usize> {
        let limit = match lateral {
            Lateral::None => return None,
            Lateral::Before(position) => position,
            Lateral::Any => usize::MAX,
        };

        self.tree
            .scope(scope)
            .outputs
            .iter()
            .filter(|c| c.position < limit)
            .filter(|c| c.transformation != Transformation::Passthrough)
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.position)
    }

    /// Scope searched next for correlated references.
    ///
    /// Expression subqueries see their enclosing scope. A derived table skips
    /// the scope whose FROM it sits in and continues above it.
    fn correlation_parent(&self, id: ScopeId) -> Option<ScopeId> {
        let context = self.tree.context_of(id);
        let scope = self.tree.scope(context);
        match (scope.kind, scope.parent) {
            (ScopeKind::Subquery, Some(parent)) if scope.derived => self.correlation_parent(parent),
            (ScopeKind::Subquery, parent) => parent,
            _ => None,
        }
    }

    fn ambiguous(&self, scope: ScopeId, column: &str, candidates: &[usize]) -> LineageError {
        let sources = &self.tree.scope(scope).sources;
        LineageError::AmbiguousColumn {
            column: column.to_string(),
            candidates: candidates
                .iter()
                .filter_map(|i| sources.get(*i))
                .map(|s| s.reference_name().unwrap_or("(subquery)").to_string())
                .collect(),
        }
    }

    /// Relation names visible from a scope, innermost first
    fn visible_names(&self, scope: ScopeId) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            for source in &self.tree.scope(id).sources {
                if let Some(name) = source.reference_name() {
                    if !names.iter().any(|n: &String| n.eq_ignore_ascii_case(name)) {
                        names.push(name.to_string());
                    }
                }
            }
            current = self.correlation_parent(id);
        }
        names
    }
}

/// Build the scope tree of `query` and qualify it
pub fn build_qualified_scopes(query: &Query, schema: &Schema) -> Result<ScopeTree, LineageError> {
    let mut tree = build_scopes(query, schema)?;
    qualify_tree(&mut tree, schema);
    Ok(tree)
}

/// Qualify every reference in the tree in place and update output states
pub fn qualify_tree(tree: &mut ScopeTree, schema: &Schema) {
    let mut failures = 0usize;

    for id in 0..tree.len() {
        let scope = tree.scope(id);

        let output_resolutions: Vec<Vec<Resolution>> = {
            let qualifier = Qualifier::new(tree, schema);
            scope
                .outputs
                .iter()
                .map(|column| {
                    column
                        .refs()
                        .iter()
                        .map(|r| {
                            to_resolution(qualifier.resolve(
                                id,
                                r.qualifier.as_deref(),
                                &r.column,
                                Lateral::Before(column.position),
                            ))
                        })
                        .collect()
                })
                .collect()
        };

        let clause_resolutions: Vec<Resolution> = {
            let qualifier = Qualifier::new(tree, schema);
            scope
                .clause_refs
                .iter()
                .map(|(_, r)| to_resolution(qualifier.resolve(id, r.qualifier.as_deref(), &r.column, Lateral::Any)))
                .collect()
        };

        let scope = tree.scope_mut(id);

        for (column, resolutions) in scope.outputs.iter_mut().zip(output_resolutions) {
            if let ColumnDef::Expr { refs, .. } = &mut column.def {
                for (column_ref, resolution) in refs.iter_mut().zip(resolutions) {
                    column_ref.resolution = resolution;
                }
            }
            column.state = output_state(column.state, column.refs());
            if column.state != QualificationState::Qualified && column.state != QualificationState::UnresolvedStar {
                failures += 1;
            }
        }

        for ((_, column_ref), resolution) in scope.clause_refs.iter_mut().zip(clause_resolutions) {
            if matches!(resolution, Resolution::Failed(_)) {
                failures += 1;
            }
            column_ref.resolution = resolution;
        }
    }

    propagate_union_states(tree);

    if failures > 0 {
        tracing::debug!(failures, "column references left unresolved");
    }
}

fn to_resolution(result: Result<ResolvedColumn, LineageError>) -> Resolution {
    match result {
        Ok(resolved) => Resolution::Resolved(resolved),
        Err(err) => Resolution::Failed(err),
    }
}

fn output_state(current: QualificationState, refs: &[ColumnRef]) -> QualificationState {
    if current == QualificationState::UnresolvedStar {
        return current;
    }

    let mut state = QualificationState::Qualified;
    for column_ref in refs {
        match &column_ref.resolution {
            Resolution::Failed(LineageError::AmbiguousColumn { .. }) => {
                if state == QualificationState::Qualified {
                    state = QualificationState::Ambiguous;
                }
            }
            Resolution::Failed(_) => state = QualificationState::Unresolved,
            _ => {}
        }
    }
    state
}

/// A UNION output is only as qualified as its branches
fn propagate_union_states(tree: &mut ScopeTree) {
    for id in (0..tree.len()).rev() {
        let scope = tree.scope(id);
        if !scope.is_union() {
            continue;
        }

        let states: Vec<QualificationState> = scope
            .outputs
            .iter()
            .map(|column| {
                scope
                    .branches
                    .iter()
                    .filter_map(|b| tree.scope(*b).output_at(column.position))
                    .map(|c| c.state)
                    .fold(column.state, worst)
            })
            .collect();

        for (column, state) in tree.scope_mut(id).outputs.iter_mut().zip(states) {
            column.state = state;
        }
    }
}

fn worst(a: QualificationState, b: QualificationState) -> QualificationState {
    fn rank(s: QualificationState) -> u8 {
        match s {
            QualificationState::Qualified => 0,
            QualificationState::UnresolvedStar => 1,
            QualificationState::Ambiguous => 2,
            QualificationState::Unresolved => 3,
        }
    }
    if rank(b) > rank(a) { b } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlParser;
    use pretty_assertions::assert_eq;

    fn qualified(sql: &str, schema: &Schema) -> ScopeTree {
        let parsed = SqlParser::new().parse(sql).unwrap();
        let statement = parsed.lineage_statement().unwrap();
        build_qualified_scopes(statement.query, schema).unwrap()
    }

    fn root_target(tree: &ScopeTree, position: usize) -> &Resolution {
        &tree.root().output_at(position).unwrap().refs()[0].resolution
    }

    #[test]
    fn alias_then_table_name() {
        let tree = qualified("SELECT o.amount, orders.status FROM orders o", &Schema::new());

        for position in [1, 2] {
            match root_target(&tree, position) {
                Resolution::Resolved(ResolvedColumn { target: ColumnTarget::Table { table, .. }, .. }) => {
                    assert_eq!(table, "orders")
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_qualifier() {
        let tree = qualified("SELECT x.id FROM users u", &Schema::new());

        match root_target(&tree, 1) {
            Resolution::Failed(LineageError::UnknownTable { qualifier, available, .. }) => {
                assert_eq!(qualifier, "x");
                assert_eq!(available, &vec!["u".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tree.root().outputs[0].state, QualificationState::Unresolved);
    }

    #[test]
    fn single_opaque_table_is_trusted() {
        let tree = qualified("SELECT id FROM users", &Schema::new());
        assert!(matches!(
            root_target(&tree, 1),
            Resolution::Resolved(ResolvedColumn { target: ColumnTarget::Table { .. }, .. })
        ));
    }

    #[test]
    fn two_opaque_tables_are_ambiguous() {
        let tree = qualified("SELECT id FROM users, orders", &Schema::new());

        match root_target(&tree, 1) {
            Resolution::Failed(LineageError::AmbiguousColumn { candidates, .. }) => {
                assert_eq!(candidates, &vec!["users".to_string(), "orders".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tree.root().outputs[0].state, QualificationState::Ambiguous);
    }

    #[test]
    fn schema_disambiguates() {
        let schema = Schema::new()
            .with_table("users", [("id", "INT"), ("email", "VARCHAR")])
            .with_table("orders", [("id", "INT"), ("user_id", "INT")]);
        let tree = qualified("SELECT email, user_id FROM users JOIN orders ON users.id = orders.user_id", &schema);

        let tables: Vec<String> = tree
            .root()
            .outputs
            .iter()
            .map(|c| match &c.refs()[0].resolution {
                Resolution::Resolved(ResolvedColumn { target: ColumnTarget::Table { table, .. }, .. }) => table.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(tables, vec!["users", "orders"]);
    }

    #[test]
    fn schema_rejects_undeclared_column() {
        let schema = Schema::new().with_table("users", [("id", "INT")]);
        let tree = qualified("SELECT nickname FROM users", &schema);

        assert!(matches!(
            root_target(&tree, 1),
            Resolution::Failed(LineageError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn lateral_alias_resolves_to_earlier_column() {
        let tree = qualified("SELECT amount * 2 AS doubled, doubled + 10 AS total FROM orders", &Schema::new());

        let second = tree.root().output_at(2).unwrap();
        assert!(matches!(
            second.refs()[0].resolution,
            Resolution::Resolved(ResolvedColumn { target: ColumnTarget::Lateral { position: 1 }, .. })
        ));
    }

    #[test]
    fn cte_output_beats_opaque_table() {
        let tree = qualified(
            "WITH totals AS (SELECT customer_id, SUM(amount) AS total FROM orders GROUP BY customer_id) \
             SELECT c.name, total FROM customers c JOIN totals t ON c.id = t.customer_id",
            &Schema::new(),
        );

        match root_target(&tree, 2) {
            Resolution::Resolved(ResolvedColumn { target: ColumnTarget::Scope { position, column, .. }, .. }) => {
                assert_eq!(*position, Some(2));
                assert_eq!(column, "total");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn correlated_reference_walks_up() {
        let tree = qualified(
            "SELECT u.id, (SELECT MAX(o.total) FROM orders o WHERE o.user_id = u.id) AS top FROM users u",
            &Schema::new(),
        );

        let subquery = tree.iter().find(|s| s.kind == ScopeKind::Subquery).unwrap();
        let (_, correlated) = subquery
            .clause_refs
            .iter()
            .find(|(_, r)| r.qualifier.as_deref() == Some("u"))
            .unwrap();
        let resolved = correlated.resolved().unwrap();
        assert_eq!(resolved.scope, ScopeTree::ROOT);
    }

    #[test]
    fn derived_table_does_not_see_sibling_relations() {
        let schema = Schema::new()
            .with_table("users", [("id", "INT"), ("nickname", "VARCHAR")])
            .with_table("orders", [("id", "INT")]);
        let tree = qualified("SELECT t.x FROM users u, (SELECT nickname AS x FROM orders) t", &schema);

        let derived = tree.iter().find(|s| s.derived).unwrap();
        assert!(matches!(
            derived.outputs[0].refs()[0].resolution,
            Resolution::Failed(LineageError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn derived_table_in_subquery_sees_outer_query() {
        let tree = qualified(
            "SELECT u.id, (SELECT d.v FROM (SELECT u.name AS v) d) AS nickname FROM users u",
            &Schema::new(),
        );

        let derived = tree.iter().find(|s| s.derived).unwrap();
        let resolved = derived.outputs[0].refs()[0].resolved().unwrap();
        assert_eq!(resolved.scope, ScopeTree::ROOT);
    }

    #[test]
    fn reference_through_unexpanded_star() {
        let tree = qualified("WITH a AS (SELECT * FROM raw_events) SELECT event_id FROM a", &Schema::new());

        match root_target(&tree, 1) {
            Resolution::Resolved(ResolvedColumn { target: ColumnTarget::Scope { scope, position, .. }, .. }) => {
                assert_eq!(*position, None);
                let schema = Schema::new();
                let qualifier = Qualifier::new(&tree, &schema);
                let behind = qualifier.resolve_behind_star(*scope, "event_id");
                assert_eq!(behind.len(), 1);
                assert!(matches!(
                    behind[0],
                    Ok(ResolvedColumn { target: ColumnTarget::Table { ref table, .. }, .. }) if table == "raw_events"
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn union_output_state_reflects_branches() {
        let tree = qualified("SELECT id FROM a UNION ALL SELECT id FROM b, c", &Schema::new());
        assert_eq!(tree.root().outputs[0].state, QualificationState::Ambiguous);
    }
}
