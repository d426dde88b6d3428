//! Expression walking helpers
//!
//! Walks stop at subquery boundaries: a nested query is its own scope and is
//! reported to the caller instead of being descended into.

use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArgumentClause, FunctionArguments, HavingBound,
    Ident, JsonPathElem, ListAggOnOverflow, Query, Subscript, WindowFrameBound, WindowType,
};
use crate::scope::ColumnRef;

/// Column references and nested queries found in one expression
#[derive(Debug, Default)]
pub struct ExprParts<'a> {
    pub refs: Vec<ColumnRef>,
    pub subqueries: Vec<&'a Query>,
}

/// Split an expression into its column references and nested queries
pub fn collect_parts(expr: &Expr) -> ExprParts<'_> {
    let mut parts = ExprParts::default();
    walk(expr, &mut |node| {
        match node {
            Expr::Identifier(ident) => parts.refs.push(ColumnRef::new(None, &ident.value)),
            Expr::CompoundIdentifier(idents) => {
                if let Some(column_ref) = compound_ref(idents) {
                    parts.refs.push(column_ref);
                }
            }
            Expr::Subquery(query) => parts.subqueries.push(query),
            Expr::InSubquery { subquery, .. } => parts.subqueries.push(subquery),
            Expr::Exists { subquery, .. } => parts.subqueries.push(subquery),
            Expr::Function(func) => {
                if let FunctionArguments::Subquery(query) = &func.args {
                    parts.subqueries.push(query);
                }
            }
            Expr::MatchAgainst { columns, .. } => {
                parts.refs.extend(columns.iter().map(|c| ColumnRef::new(None, &c.value)));
            }
            Expr::Lambda(lambda) => {
                // Parameters are bound by the lambda, not by any source
                let body = collect_parts(&lambda.body);
                parts.refs.extend(body.refs.into_iter().filter(|r| {
                    r.qualifier.is_some() || !lambda.params.iter().any(|p| p.value.eq_ignore_ascii_case(&r.column))
                }));
                parts.subqueries.extend(body.subqueries);
                return false;
            }
            _ => {}
        }
        true
    });
    parts
}

/// `a.b.c` -> qualifier `a.b`, column `c`
pub fn compound_ref(idents: &[Ident]) -> Option<ColumnRef> {
    let (column, qualifier) = idents.split_last()?;
    let qualifier = if qualifier.is_empty() {
        None
    } else {
        Some(
            qualifier
                .iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        )
    };
    Some(ColumnRef::new(qualifier, &column.value))
}

/// Pre-order walk. `visit` returns whether to descend into the node's children.
pub fn walk<'a, F>(expr: &'a Expr, visit: &mut F)
where
    F: FnMut(&'a Expr) -> bool,
{
    if !visit(expr) {
        return;
    }
    for child in children(expr) {
        walk(child, visit);
    }
}

/// Whether any node (outside nested queries) satisfies `pred`
pub fn any<F>(expr: &Expr, mut pred: F) -> bool
where
    F: FnMut(&Expr) -> bool,
{
    let mut found = false;
    walk(expr, &mut |node| {
        if found {
            return false;
        }
        if pred(node) {
            found = true;
        }
        !found
    });
    found
}

/// Direct sub-expressions, excluding nested queries.
///
/// The match is exhaustive so a new `Expr` variant cannot hide column
/// references from lineage.
pub fn children(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Identifier(_)
        | Expr::CompoundIdentifier(_)
        | Expr::Value(_)
        | Expr::IntroducedString { .. }
        | Expr::TypedString { .. }
        | Expr::MatchAgainst { .. }
        | Expr::Wildcard(_)
        | Expr::QualifiedWildcard(..)
        | Expr::Exists { .. }
        | Expr::Subquery(_) => Vec::new(),

        Expr::BinaryOp { left, right, .. }
        | Expr::AnyOp { left, right, .. }
        | Expr::AllOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr)
        | Expr::IsUnknown(expr)
        | Expr::IsNotUnknown(expr)
        | Expr::OuterJoin(expr)
        | Expr::Prior(expr) => vec![expr.as_ref()],
        Expr::IsDistinctFrom(a, b) | Expr::IsNotDistinctFrom(a, b) => vec![a.as_ref(), b.as_ref()],
        Expr::InList { expr, list, .. } => {
            let mut out = vec![expr.as_ref()];
            out.extend(list.iter());
            out
        }
        Expr::InSubquery { expr, .. } => vec![expr.as_ref()],
        Expr::InUnnest { expr, array_expr, .. } => vec![expr.as_ref(), array_expr.as_ref()],
        Expr::Between { expr, low, high, .. } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. }
        | Expr::RLike { expr, pattern, .. } => vec![expr.as_ref(), pattern.as_ref()],
        Expr::Cast { expr, .. }
        | Expr::Extract { expr, .. }
        | Expr::Ceil { expr, .. }
        | Expr::Floor { expr, .. }
        | Expr::Collate { expr, .. }
        | Expr::CompositeAccess { expr, .. }
        | Expr::Named { expr, .. } => vec![expr.as_ref()],
        Expr::Convert { expr, styles, .. } => {
            let mut out = vec![expr.as_ref()];
            out.extend(styles.iter());
            out
        }
        Expr::Position { expr, r#in } => vec![expr.as_ref(), r#in.as_ref()],
        Expr::AtTimeZone { timestamp, time_zone } => vec![timestamp.as_ref(), time_zone.as_ref()],
        Expr::Substring { expr, substring_from, substring_for, .. } => {
            let mut out = vec![expr.as_ref()];
            out.extend(substring_from.as_deref());
            out.extend(substring_for.as_deref());
            out
        }
        Expr::Trim { expr, trim_what, trim_characters, .. } => {
            let mut out = vec![expr.as_ref()];
            out.extend(trim_what.as_deref());
            out.extend(trim_characters.iter().flatten());
            out
        }
        Expr::Overlay { expr, overlay_what, overlay_from, overlay_for } => {
            let mut out = vec![expr.as_ref(), overlay_what.as_ref(), overlay_from.as_ref()];
            out.extend(overlay_for.as_deref());
            out
        }
        Expr::Case { operand, conditions, results, else_result } => {
            let mut out = Vec::new();
            out.extend(operand.as_deref());
            out.extend(conditions.iter());
            out.extend(results.iter());
            out.extend(else_result.as_deref());
            out
        }
        Expr::JsonAccess { value, path } => {
            let mut out = vec![value.as_ref()];
            out.extend(path.path.iter().filter_map(|elem| match elem {
                JsonPathElem::Bracket { key } => Some(key),
                JsonPathElem::Dot { .. } => None,
            }));
            out
        }
        Expr::MapAccess { column, keys } => {
            let mut out = vec![column.as_ref()];
            out.extend(keys.iter().map(|k| &k.key));
            out
        }
        Expr::Subscript { expr, subscript } => {
            let mut out = vec![expr.as_ref()];
            match subscript.as_ref() {
                Subscript::Index { index } => out.push(index),
                Subscript::Slice { lower_bound, upper_bound, stride } => {
                    out.extend(lower_bound.iter());
                    out.extend(upper_bound.iter());
                    out.extend(stride.iter());
                }
            }
            out
        }
        Expr::Method(method) => {
            let mut out = vec![method.expr.as_ref()];
            for func in &method.method_chain {
                out.extend(function_children(func));
            }
            out
        }
        Expr::GroupingSets(sets) | Expr::Cube(sets) | Expr::Rollup(sets) => sets.iter().flatten().collect(),
        Expr::Tuple(items) => items.iter().collect(),
        Expr::Struct { values, .. } => values.iter().collect(),
        Expr::Dictionary(fields) => fields.iter().map(|f| f.value.as_ref()).collect(),
        Expr::Map(map) => map
            .entries
            .iter()
            .flat_map(|entry| [entry.key.as_ref(), entry.value.as_ref()])
            .collect(),
        Expr::Array(array) => array.elem.iter().collect(),
        Expr::Interval(interval) => vec![interval.value.as_ref()],
        Expr::Lambda(lambda) => vec![lambda.body.as_ref()],
        Expr::Function(func) => function_children(func),
    }
}

/// Arguments, argument clauses, FILTER, WITHIN GROUP and OVER expressions of
/// a function call
pub fn function_children(func: &Function) -> Vec<&Expr> {
    let mut out = argument_exprs(&func.parameters);
    out.extend(function_args(func));

    if let FunctionArguments::List(list) = &func.args {
        for clause in &list.clauses {
            match clause {
                FunctionArgumentClause::OrderBy(order_by) => out.extend(order_by.iter().map(|o| &o.expr)),
                FunctionArgumentClause::Limit(limit) => out.push(limit),
                FunctionArgumentClause::Having(HavingBound(_, bound)) => out.push(bound),
                FunctionArgumentClause::OnOverflow(ListAggOnOverflow::Truncate { filler, .. }) => {
                    out.extend(filler.as_deref());
                }
                FunctionArgumentClause::OnOverflow(ListAggOnOverflow::Error)
                | FunctionArgumentClause::IgnoreOrRespectNulls(_)
                | FunctionArgumentClause::Separator(_)
                | FunctionArgumentClause::JsonNullClause(_) => {}
            }
        }
    }

    out.extend(func.filter.as_deref());
    out.extend(func.within_group.iter().map(|o| &o.expr));

    if let Some(WindowType::WindowSpec(spec)) = &func.over {
        out.extend(spec.partition_by.iter());
        out.extend(spec.order_by.iter().map(|o| &o.expr));
        if let Some(frame) = &spec.window_frame {
            out.extend(frame_bound_expr(&frame.start_bound));
            out.extend(frame.end_bound.as_ref().and_then(frame_bound_expr));
        }
    }

    out
}

fn frame_bound_expr(bound: &WindowFrameBound) -> Option<&Expr> {
    match bound {
        WindowFrameBound::Preceding(expr) | WindowFrameBound::Following(expr) => expr.as_deref(),
        WindowFrameBound::CurrentRow => None,
    }
}

/// Plain argument expressions of a function call (wildcards skipped)
pub fn function_args(func: &Function) -> Vec<&Expr> {
    argument_exprs(&func.args)
}

fn argument_exprs(args: &FunctionArguments) -> Vec<&Expr> {
    let FunctionArguments::List(list) = args else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for arg in &list.args {
        let arg_expr = match arg {
            FunctionArg::Unnamed(arg_expr) | FunctionArg::Named { arg: arg_expr, .. } => arg_expr,
            FunctionArg::ExprNamed { name, arg, .. } => {
                out.push(name);
                arg
            }
        };
        if let FunctionArgExpr::Expr(expr) = arg_expr {
            out.push(expr);
        }
    }
    out
}

/// Whether the call is `COUNT(*)`-style
pub fn has_wildcard_arg(func: &Function) -> bool {
    match &func.args {
        FunctionArguments::List(list) => list.args.iter().any(|arg| {
            matches!(
                arg,
                FunctionArg::Unnamed(FunctionArgExpr::Wildcard)
                    | FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(_))
            )
        }),
        _ => false,
    }
}

/// Upper-cased last segment of the function name
pub fn function_name(func: &Function) -> String {
    func.name
        .0
        .last()
        .map(|ident| ident.value.to_uppercase())
        .unwrap_or_default()
}

/// Strip redundant parentheses
pub fn unwrap_nested(expr: &Expr) -> &Expr {
    match expr {
        Expr::Nested(inner) => unwrap_nested(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlparser::ast::{SelectItem, SetExpr, Statement};
    use sqlparser::dialect::{
        BigQueryDialect, DatabricksDialect, Dialect, GenericDialect, MySqlDialect, SnowflakeDialect,
    };
    use sqlparser::parser::Parser;

    fn first_projection(sql: &str) -> Expr {
        projection_in(&GenericDialect {}, sql)
    }

    fn projection_in(dialect: &dyn Dialect, sql: &str) -> Expr {
        let statements = Parser::parse_sql(dialect, sql).unwrap();
        let Statement::Query(query) = &statements[0] else { panic!("not a query") };
        let SetExpr::Select(select) = query.body.as_ref() else { panic!("not a select") };
        match &select.projection[0] {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr.clone(),
            _ => panic!("wildcard"),
        }
    }

    #[test]
    fn collects_refs_through_functions_and_case() {
        let expr = first_projection(
            "SELECT CASE WHEN o.status = 'x' THEN SUM(amount) ELSE COALESCE(u.bonus, 0) END FROM t",
        );
        let parts = collect_parts(&expr);
        let names: Vec<_> = parts.refs.iter().map(|r| r.display_name()).collect();

        assert_eq!(names, vec!["o.status", "amount", "u.bonus"]);
        assert!(parts.subqueries.is_empty());
    }

    #[test]
    fn stops_at_subqueries() {
        let expr = first_projection("SELECT a + (SELECT MAX(b) FROM t2) FROM t1");
        let parts = collect_parts(&expr);

        assert_eq!(parts.refs.len(), 1);
        assert_eq!(parts.refs[0].column, "a");
        assert_eq!(parts.subqueries.len(), 1);
    }

    #[test]
    fn includes_window_partition_columns() {
        let expr = first_projection(
            "SELECT ROW_NUMBER() OVER (PARTITION BY customer_id ORDER BY created_at) FROM t",
        );
        let parts = collect_parts(&expr);
        let names: Vec<_> = parts.refs.iter().map(|r| r.column.as_str()).collect();

        assert_eq!(names, vec!["customer_id", "created_at"]);
    }

    #[test]
    fn dotted_qualifier_is_kept() {
        let expr = first_projection("SELECT analytics.users.id FROM analytics.users");
        let parts = collect_parts(&expr);

        assert_eq!(parts.refs[0].qualifier.as_deref(), Some("analytics.users"));
        assert_eq!(parts.refs[0].column, "id");
    }

    fn ref_names(dialect: &dyn Dialect, sql: &str) -> Vec<String> {
        let expr = projection_in(dialect, sql);
        collect_parts(&expr).refs.iter().map(|r| r.display_name()).collect()
    }

    #[test]
    fn array_subscripts_and_slices() {
        assert_eq!(ref_names(&GenericDialect {}, "SELECT arr[1] AS first FROM t"), vec!["arr"]);
        assert_eq!(ref_names(&GenericDialect {}, "SELECT arr[lo:hi] FROM t"), vec!["arr", "lo", "hi"]);
    }

    #[test]
    fn map_access_keys() {
        assert_eq!(ref_names(&BigQueryDialect {}, "SELECT tags[idx] FROM t"), vec!["tags", "idx"]);
    }

    #[test]
    fn json_access_base_column() {
        assert_eq!(ref_names(&SnowflakeDialect {}, "SELECT payload:customer FROM t"), vec!["payload"]);
    }

    #[test]
    fn composite_field_access() {
        assert_eq!(ref_names(&GenericDialect {}, "SELECT (address).street FROM t"), vec!["address"]);
    }

    #[test]
    fn struct_fields_and_named_values() {
        assert_eq!(ref_names(&GenericDialect {}, "SELECT STRUCT(a AS x, b) FROM t"), vec!["a", "b"]);
    }

    #[test]
    fn overlay_operands() {
        assert_eq!(
            ref_names(&GenericDialect {}, "SELECT OVERLAY(name PLACING tag FROM pos) FROM t"),
            vec!["name", "tag", "pos"]
        );
    }

    #[test]
    fn convert_value() {
        assert_eq!(ref_names(&GenericDialect {}, "SELECT CONVERT(amount, CHAR) FROM t"), vec!["amount"]);
    }

    #[test]
    fn map_and_dictionary_literals() {
        assert_eq!(ref_names(&GenericDialect {}, "SELECT MAP {'k': v} FROM t"), vec!["v"]);
        assert_eq!(ref_names(&GenericDialect {}, "SELECT {'k': v} FROM t"), vec!["v"]);
    }

    #[test]
    fn rlike_pattern_column() {
        assert_eq!(ref_names(&MySqlDialect {}, "SELECT a RLIKE p FROM t"), vec!["a", "p"]);
    }

    #[test]
    fn aggregate_order_by_clause() {
        assert_eq!(ref_names(&GenericDialect {}, "SELECT ARRAY_AGG(a ORDER BY b) FROM t"), vec!["a", "b"]);
    }

    #[test]
    fn lambda_parameters_are_not_columns() {
        assert_eq!(
            ref_names(&DatabricksDialect {}, "SELECT transform(items, x -> x + bonus) FROM t"),
            vec!["items", "bonus"]
        );
    }
}
