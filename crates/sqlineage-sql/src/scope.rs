//! Scope tree model
//!
//! A query is partitioned into lexical scopes (root, CTE, derived table or
//! expression subquery, UNION branch). Scopes live in an arena indexed by
//! [`ScopeId`]; parent links are ids and only used for navigation.

use serde::Serialize;
use sqlineage_core::{InferredType, LineageError};

/// Index of a scope inside its [`ScopeTree`]
pub type ScopeId = usize;

/// Kind of lexical scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Outermost query
    Root,

    /// Common table expression
    Cte,

    /// Derived table in FROM, or scalar / IN / EXISTS subquery
    Subquery,

    /// One side of a UNION / INTERSECT / EXCEPT
    UnionBranch,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Cte => write!(f, "cte"),
            Self::Subquery => write!(f, "subquery"),
            Self::UnionBranch => write!(f, "union_branch"),
        }
    }
}

/// Relation visible inside a scope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    /// Alias from `AS alias`, if any
    pub alias: Option<String>,

    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceKind {
    /// Physical table
    Table {
        /// Last name segment (`orders` for `raw.sales.orders`)
        name: String,
        /// Name as written (`raw.sales.orders`)
        qualified_name: String,
        database: Option<String>,
        catalog: Option<String>,
    },

    /// Reference to a CTE declared earlier
    Cte { name: String, scope: ScopeId },

    /// Derived table
    Subquery { scope: ScopeId },
}

impl Source {
    /// Name the source is addressed by inside the scope
    pub fn reference_name(&self) -> Option<&str> {
        if let Some(alias) = &self.alias {
            return Some(alias);
        }
        match &self.kind {
            SourceKind::Table { name, .. } => Some(name),
            SourceKind::Cte { name, .. } => Some(name),
            SourceKind::Subquery { .. } => None,
        }
    }

    /// Underlying relation name (table or CTE), ignoring the alias
    pub fn relation_name(&self) -> Option<&str> {
        match &self.kind {
            SourceKind::Table { name, .. } => Some(name),
            SourceKind::Cte { name, .. } => Some(name),
            SourceKind::Subquery { .. } => None,
        }
    }

    /// Child scope for CTE and derived-table sources
    pub fn scope(&self) -> Option<ScopeId> {
        match &self.kind {
            SourceKind::Cte { scope, .. } | SourceKind::Subquery { scope } => Some(*scope),
            SourceKind::Table { .. } => None,
        }
    }

    /// Whether an alias name matches this source
    pub fn matches_alias(&self, qualifier: &str) -> bool {
        self.alias
            .as_deref()
            .is_some_and(|alias| alias.eq_ignore_ascii_case(qualifier))
    }

    /// Whether a raw table/CTE name matches this source
    pub fn matches_relation(&self, qualifier: &str) -> bool {
        match &self.kind {
            SourceKind::Table { name, qualified_name, .. } => {
                name.eq_ignore_ascii_case(qualifier)
                    || qualified_name.eq_ignore_ascii_case(qualifier)
                    || qualifier
                        .rsplit_once('.')
                        .is_some_and(|(_, last)| name.eq_ignore_ascii_case(last))
            }
            SourceKind::Cte { name, .. } => name.eq_ignore_ascii_case(qualifier),
            SourceKind::Subquery { .. } => false,
        }
    }
}

/// How an output column is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Passthrough,
    Renamed,
    Derived,
    Aggregated,
    WindowFunction,
}

impl std::fmt::Display for Transformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough => write!(f, "passthrough"),
            Self::Renamed => write!(f, "renamed"),
            Self::Derived => write!(f, "derived"),
            Self::Aggregated => write!(f, "aggregated"),
            Self::WindowFunction => write!(f, "window_function"),
        }
    }
}

/// Aggregate function applied to a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationInfo {
    /// Function name, or `DERIVED` when the expression combines aggregates
    pub function: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_columns: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contains: Vec<AggregationInfo>,
}

/// Qualification state of an output column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationState {
    /// Every reference resolved
    Qualified,

    /// Column stands for `*` over a source without a known schema
    UnresolvedStar,

    /// At least one reference matched several sources
    Ambiguous,

    /// At least one reference could not be resolved
    Unresolved,
}

/// What an output column is computed from
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDef {
    /// Projection expression
    Expr {
        /// Column references in the expression, outside nested subqueries
        refs: Vec<ColumnRef>,
        /// Expression subqueries the value depends on
        subqueries: Vec<ScopeId>,
    },

    /// Synthetic UNION output, the column at the same position of each branch
    UnionOf(Vec<ScopeId>),

    /// `*` or `alias.*` that could not be expanded
    UnresolvedStar { qualifier: Option<String> },
}

/// Column produced by a scope
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    /// 1-based position in the projection
    pub position: usize,

    pub name: String,

    /// Rendered defining expression
    pub expression: String,

    pub def: ColumnDef,

    pub state: QualificationState,

    pub transformation: Transformation,

    pub aggregation: Option<AggregationInfo>,

    /// GROUP BY expressions, set on aggregated columns of grouped scopes
    pub grouped_by: Option<Vec<String>>,

    pub data_type: InferredType,
}

impl OutputColumn {
    pub fn is_unresolved_star(&self) -> bool {
        matches!(self.def, ColumnDef::UnresolvedStar { .. })
    }

    /// Column references of the defining expression
    pub fn refs(&self) -> &[ColumnRef] {
        match &self.def {
            ColumnDef::Expr { refs, .. } => refs,
            _ => &[],
        }
    }

    /// Bare column reference (`x` or `t.x`) passed through unchanged
    pub fn is_passthrough(&self) -> bool {
        match &self.def {
            ColumnDef::Expr { refs, subqueries } => {
                self.transformation == Transformation::Passthrough
                    && refs.len() == 1
                    && subqueries.is_empty()
            }
            _ => false,
        }
    }
}

/// Column mention inside an expression
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    /// Table, alias or CTE qualifier as written (may be dotted)
    pub qualifier: Option<String>,

    pub column: String,

    pub resolution: Resolution,
}

impl ColumnRef {
    pub fn new(qualifier: Option<String>, column: impl Into<String>) -> Self {
        Self {
            qualifier,
            column: column.into(),
            resolution: Resolution::Pending,
        }
    }

    /// Reference as written (`o.amount`)
    pub fn display_name(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}", q, self.column),
            None => self.column.clone(),
        }
    }

    pub fn resolved(&self) -> Option<&ResolvedColumn> {
        match &self.resolution {
            Resolution::Resolved(resolved) => Some(resolved),
            _ => None,
        }
    }
}

/// Outcome of qualifying a [`ColumnRef`]
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Not qualified yet
    Pending,

    Resolved(ResolvedColumn),

    /// Qualification failed; kept for reporting
    Failed(LineageError),
}

/// Concrete origin of a column reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedColumn {
    /// Scope owning the matched source (differs from the referencing scope
    /// for correlated references)
    pub scope: ScopeId,

    /// Index into that scope's sources; `None` for lateral aliases
    pub source: Option<usize>,

    pub target: ColumnTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnTarget {
    /// Physical table column
    Table { table: String, column: String },

    /// Output column of a CTE or derived table. `position` is `None` when the
    /// column only exists behind an unexpanded `*`.
    Scope {
        scope: ScopeId,
        position: Option<usize>,
        column: String,
    },

    /// Earlier output column of the same SELECT
    Lateral { position: usize },
}

/// Clause a non-projection reference appears in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Join,
    Where,
    GroupBy,
    Having,
    Qualify,
}

impl Clause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Where => "where",
            Self::GroupBy => "group_by",
            Self::Having => "having",
            Self::Qualify => "qualify",
        }
    }
}

/// Lexical scope
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,

    /// CTE name or derived-table alias
    pub name: Option<String>,

    pub parent: Option<ScopeId>,

    /// Non-LATERAL derived table in FROM: its sibling relations are not visible
    pub derived: bool,

    /// Relations from FROM / JOIN, in order
    pub sources: Vec<Source>,

    /// Projection, positions 1..=n
    pub outputs: Vec<OutputColumn>,

    /// UNION branches when this is a synthetic union parent
    pub branches: Vec<ScopeId>,

    /// CTEs declared by this scope's WITH, in declaration order
    pub ctes: Vec<ScopeId>,

    /// References outside the projection
    pub clause_refs: Vec<(Clause, ColumnRef)>,

    /// Rendered GROUP BY expressions
    pub group_by: Vec<String>,
}

impl Scope {
    fn new(id: ScopeId, kind: ScopeKind, name: Option<String>, parent: Option<ScopeId>) -> Self {
        Self {
            id,
            kind,
            name,
            parent,
            derived: false,
            sources: Vec::new(),
            outputs: Vec::new(),
            branches: Vec::new(),
            ctes: Vec::new(),
            clause_refs: Vec::new(),
            group_by: Vec::new(),
        }
    }

    pub fn is_union(&self) -> bool {
        !self.branches.is_empty()
    }

    /// Output column by name (case-insensitive), first match
    pub fn output(&self, name: &str) -> Option<&OutputColumn> {
        self.outputs.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Output column by 1-based position
    pub fn output_at(&self, position: usize) -> Option<&OutputColumn> {
        position.checked_sub(1).and_then(|i| self.outputs.get(i))
    }

    /// Whether an unexpanded `*` hides part of the projection
    pub fn has_unresolved_star(&self) -> bool {
        self.outputs.iter().any(|c| c.is_unresolved_star())
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|c| c.name.clone()).collect()
    }
}

/// Arena of scopes; the root is always id 0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl ScopeTree {
    pub const ROOT: ScopeId = 0;

    pub(crate) fn alloc(&mut self, kind: ScopeKind, name: Option<String>, parent: Option<ScopeId>) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope::new(id, kind, name, parent));
        id
    }

    pub fn root(&self) -> &Scope {
        &self.scopes[Self::ROOT]
    }

    /// Panics on an id that does not come from this tree
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub(crate) fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id]
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    /// Every CTE scope, breadth-first: the root's CTEs first in declaration
    /// order, then CTEs nested inside those, and so on
    pub fn ctes_breadth_first(&self) -> Vec<ScopeId> {
        let mut order = Vec::new();
        let mut queue = std::collections::VecDeque::from([Self::ROOT]);
        let mut seen = vec![false; self.scopes.len()];

        while let Some(id) = queue.pop_front() {
            if seen[id] {
                continue;
            }
            seen[id] = true;

            let scope = &self.scopes[id];
            if scope.kind == ScopeKind::Cte {
                order.push(id);
            }
            queue.extend(scope.ctes.iter().copied());
            queue.extend(scope.branches.iter().copied());
            queue.extend(
                self.scopes
                    .iter()
                    .filter(|s| s.parent == Some(id) && s.kind != ScopeKind::Cte && !scope.branches.contains(&s.id))
                    .map(|s| s.id),
            );
        }

        order
    }

    /// Names of every CTE, breadth-first
    pub fn cte_names(&self) -> Vec<String> {
        self.ctes_breadth_first()
            .into_iter()
            .filter_map(|id| self.scopes[id].name.clone())
            .collect()
    }

    /// Nearest enclosing scope that is not a UNION branch
    pub fn context_of(&self, id: ScopeId) -> ScopeId {
        let mut current = id;
        while let Some(scope) = self.scopes.get(current) {
            match (scope.kind, scope.parent) {
                (ScopeKind::UnionBranch, Some(parent)) => current = parent,
                _ => break,
            }
        }
        current
    }

    /// Display label used in node names (`step1`, `t`, `union#2`)
    pub fn label(&self, id: ScopeId) -> Option<String> {
        let scope = self.scopes.get(id)?;
        match scope.kind {
            ScopeKind::Root => None,
            ScopeKind::Cte => scope.name.clone(),
            ScopeKind::Subquery => Some(
                scope
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("subquery_{}", id)),
            ),
            ScopeKind::UnionBranch => {
                let parent = scope.parent?;
                let index = self.scopes[parent]
                    .branches
                    .iter()
                    .position(|b| *b == id)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                let base = self.label(parent).unwrap_or_else(|| "union".to_string());
                Some(format!("{}#{}", base, index))
            }
        }
    }

    /// Every column reference in the tree with the scope it appears in
    pub fn all_refs(&self) -> impl Iterator<Item = (ScopeId, &ColumnRef)> {
        self.scopes.iter().flat_map(|scope| {
            let outputs = scope
                .outputs
                .iter()
                .flat_map(|c| c.refs().iter())
                .map(move |r| (scope.id, r));
            let clauses = scope.clause_refs.iter().map(move |(_, r)| (scope.id, r));
            outputs.chain(clauses)
        })
    }
}
