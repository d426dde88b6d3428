//! Impact diff between two versions of a query
//!
//! Runs impact analysis on both versions and compares the impacted columns
//! by key: root output columns by name, CTE columns by `cte.column`. A name
//! that repeats within one version is keyed `name#position` instead.

use crate::impact::{impact, ImpactGraph, ImpactOptions, ImpactResult};
use crate::query::LineageQuery;
use indexmap::IndexMap;
use serde::Serialize;
use sqlineage_core::{LimitsConfig, LineageError};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Rejected: a diff compares full expressions
    pub summary_only: bool,

    /// Rejected for the same reason as `summary_only`
    pub max_expr_length: Option<usize>,

    pub include_graph: bool,

    pub limits: LimitsConfig,
}

impl DiffOptions {
    /// Fail on options that would hide expression changes
    pub fn validate(&self) -> Result<(), LineageError> {
        if self.summary_only {
            return Err(LineageError::DiffModeConstraint { option: "summary_only".to_string() });
        }
        if self.max_expr_length.is_some_and(|max| max > 0) {
            return Err(LineageError::DiffModeConstraint { option: "max_expr_length".to_string() });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffResult {
    pub success: bool,
    pub source_column: String,
    pub diff_summary: DiffSummary,
    pub outputs: ColumnChanges,
    pub ctes: ColumnChanges,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub graphs: Option<DiffGraphs>,
}

impl DiffResult {
    /// No impacted column was added, removed or changed
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.ctes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub outputs_added: usize,
    pub outputs_removed: usize,
    pub outputs_changed: usize,
    pub ctes_added: usize,
    pub ctes_removed: usize,
    pub ctes_changed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ChangedColumn>,
}

impl ColumnChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    fn compare(old: &IndexMap<String, String>, new: &IndexMap<String, String>) -> Self {
        let mut changes = Self::default();

        for (name, new_expr) in new {
            match old.get(name) {
                Some(old_expr) if old_expr != new_expr => changes.changed.push(ChangedColumn {
                    name: name.clone(),
                    old: old_expr.clone(),
                    new: new_expr.clone(),
                }),
                Some(_) => {}
                None => changes.added.push(name.clone()),
            }
        }

        // Columns only the old version impacted
        for name in old.keys() {
            if !new.contains_key(name) {
                changes.removed.push(name.clone());
            }
        }

        changes
    }
}

/// Impacted column whose expression differs between versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedColumn {
    pub name: String,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffGraphs {
    pub old: Option<ImpactGraph>,
    pub new: Option<ImpactGraph>,
}

/// Impacted columns of one version, keyed for comparison
#[derive(Default)]
struct ImpactedKeys {
    outputs: IndexMap<String, String>,
    ctes: IndexMap<String, String>,
    graph: Option<ImpactGraph>,
}

impl ImpactedKeys {
    fn collect(query: &LineageQuery<'_>, source_column: &str, options: &DiffOptions) -> Result<Self, LineageError> {
        let impact_options = ImpactOptions {
            include_graph: options.include_graph,
            limits: options.limits,
            ..Default::default()
        };

        // A version that does not read the column has no impacted columns
        let report = match impact(query, source_column, &impact_options)? {
            ImpactResult::Impacted(report) => report,
            ImpactResult::NotFound(_) => return Ok(Self::default()),
        };

        let outputs = report
            .impacted_output_columns
            .into_iter()
            .map(|column| (column.column, column.position, column.expression.unwrap_or_default()));
        let ctes = report.impacted_cte_columns.into_iter().map(|column| {
            let name = format!("{}.{}", column.cte, column.column);
            (name, column.position, column.expression.unwrap_or_default())
        });

        Ok(Self {
            outputs: keyed(outputs),
            ctes: keyed(ctes),
            graph: report.graph,
        })
    }
}

/// Key `(name, position, expression)` entries by name, or by
/// `name#position` for names that occur more than once
fn keyed(columns: impl Iterator<Item = (String, usize, String)>) -> IndexMap<String, String> {
    let columns: Vec<_> = columns.collect();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (name, _, _) in &columns {
        *counts.entry(name.to_ascii_lowercase()).or_default() += 1;
    }

    columns
        .into_iter()
        .map(|(name, position, expression)| {
            let key = if counts.get(&name.to_ascii_lowercase()).copied().unwrap_or(0) > 1 {
                format!("{}#{}", name, position)
            } else {
                name
            };
            (key, expression)
        })
        .collect()
}

/// Compare the columns `source_column` impacts in `old` and `new`
pub fn diff(
    old: &LineageQuery<'_>,
    new: &LineageQuery<'_>,
    source_column: &str,
    options: &DiffOptions,
) -> Result<DiffResult, LineageError> {
    options.validate()?;

    let before = ImpactedKeys::collect(old, source_column, options)?;
    let after = ImpactedKeys::collect(new, source_column, options)?;

    let outputs = ColumnChanges::compare(&before.outputs, &after.outputs);
    let ctes = ColumnChanges::compare(&before.ctes, &after.ctes);

    let diff_summary = DiffSummary {
        outputs_added: outputs.added.len(),
        outputs_removed: outputs.removed.len(),
        outputs_changed: outputs.changed.len(),
        ctes_added: ctes.added.len(),
        ctes_removed: ctes.removed.len(),
        ctes_changed: ctes.changed.len(),
    };

    tracing::debug!(source_column, ?diff_summary, "impact diff complete");

    let graphs = options.include_graph.then(|| DiffGraphs {
        old: before.graph,
        new: after.graph,
    });

    Ok(DiffResult {
        success: true,
        source_column: source_column.to_string(),
        diff_summary,
        outputs,
        ctes,
        graphs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlineage_core::Schema;
    use sqlineage_sql::SqlParser;

    fn run(old: &str, new: &str, source: &str) -> DiffResult {
        let schema = Schema::new();
        let parser = SqlParser::new();
        let old = LineageQuery::parse(&parser, old, &schema).unwrap();
        let new = LineageQuery::parse(&parser, new, &schema).unwrap();
        diff(&old, &new, source, &DiffOptions::default()).unwrap()
    }

    #[test]
    fn test_added_removed_changed() {
        let old = "WITH t AS (SELECT amount FROM orders) SELECT amount AS gross, amount * 2 AS doubled FROM t";
        let new = "WITH t AS (SELECT amount FROM orders) SELECT amount * 3 AS doubled, amount AS net FROM t";
        let result = run(old, new, "orders.amount");

        assert_eq!(result.outputs.added, vec!["net"]);
        assert_eq!(result.outputs.removed, vec!["gross"]);
        assert_eq!(
            result.outputs.changed,
            vec![ChangedColumn {
                name: "doubled".to_string(),
                old: "amount * 2".to_string(),
                new: "amount * 3".to_string(),
            }]
        );
        assert!(result.ctes.is_empty());
        assert_eq!(result.diff_summary.outputs_changed, 1);
    }

    #[test]
    fn test_column_dropped_from_new_version() {
        let old = "SELECT status FROM orders";
        let new = "SELECT id FROM orders";
        let result = run(old, new, "orders.status");

        assert_eq!(result.outputs.removed, vec!["status"]);
        assert!(result.outputs.added.is_empty());
    }

    #[test]
    fn test_duplicate_output_names_are_kept_apart() {
        let old = "SELECT amount AS v, amount + 1 AS v FROM orders";
        let new = "SELECT amount AS v, amount + 2 AS v FROM orders";
        let result = run(old, new, "orders.amount");

        assert!(result.outputs.added.is_empty());
        assert!(result.outputs.removed.is_empty());
        assert_eq!(
            result.outputs.changed,
            vec![ChangedColumn {
                name: "v#2".to_string(),
                old: "amount + 1".to_string(),
                new: "amount + 2".to_string(),
            }]
        );
    }

    #[test]
    fn test_options_that_hide_expressions_are_rejected() {
        let summary = DiffOptions { summary_only: true, ..Default::default() };
        assert_eq!(
            summary.validate(),
            Err(LineageError::DiffModeConstraint { option: "summary_only".to_string() })
        );

        let truncated = DiffOptions { max_expr_length: Some(40), ..Default::default() };
        assert!(matches!(truncated.validate(), Err(LineageError::DiffModeConstraint { .. })));

        assert!(DiffOptions::default().validate().is_ok());
    }
}
