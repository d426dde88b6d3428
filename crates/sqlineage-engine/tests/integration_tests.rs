//! End-to-end lineage tests: trace, impact and diff over parsed SQL

use pretty_assertions::assert_eq;
use sqlineage_core::{DiagnosticCode, LineageError, Schema};
use sqlineage_engine::{
    diff, impact, trace, DiffOptions, ImpactOptions, ImpactResult, LineageQuery, NodeKind, TraceOptions,
    TraceResult,
};
use sqlineage_sql::SqlParser;

const PIPELINE: &str = "\
WITH customer_orders AS (
    SELECT o.customer_id, o.amount, o.status
    FROM orders o
    WHERE o.status <> 'cancelled'
),
totals AS (
    SELECT customer_id, SUM(amount) AS total_amount, COUNT(*) AS order_count
    FROM customer_orders
    GROUP BY customer_id
)
SELECT
    c.id AS customer_id,
    c.email,
    t.total_amount,
    t.total_amount / NULLIF(t.order_count, 0) AS avg_order
FROM customers c
LEFT JOIN totals t ON c.id = t.customer_id";

fn query<'a>(sql: &'a str, schema: &'a Schema) -> LineageQuery<'a> {
    LineageQuery::parse(&SqlParser::new(), sql, schema).unwrap()
}

fn traced(sql: &str, target: &str) -> TraceResult {
    let schema = Schema::new();
    trace(&query(sql, &schema), target, &TraceOptions::default())
}

#[test]
fn derived_table_passthrough_yields_two_nodes() {
    match traced("SELECT id AS user_id FROM (SELECT id FROM users) t", "user_id") {
        TraceResult::FoundInOutput(found) => {
            let nodes: Vec<(&str, NodeKind)> = found.graph.nodes.iter().map(|n| (n.name.as_str(), n.kind)).collect();
            assert_eq!(nodes, vec![("user_id", NodeKind::Derived), ("users.id", NodeKind::Table)]);
            assert_eq!(found.graph.source_tables, vec!["users"]);
            assert_eq!(found.graph.edges.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn cte_chain_expands_to_source_table() {
    let sql = "WITH step1 AS (SELECT amount FROM orders), \
               step2 AS (SELECT amount * 1.1 AS adjusted FROM step1) \
               SELECT adjusted FROM step2";

    match traced(sql, "adjusted") {
        TraceResult::FoundInOutput(found) => {
            let names: Vec<&str> = found.graph.nodes.iter().map(|n| n.name.as_str()).collect();
            assert_eq!(names, vec!["adjusted", "step2.adjusted", "step1.amount", "orders.amount"]);

            let depths: Vec<usize> = found.graph.nodes.iter().map(|n| n.depth).collect();
            assert_eq!(depths, vec![0, 1, 2, 3]);

            let terminal = &found.graph.nodes[3];
            assert_eq!(terminal.kind, NodeKind::Table);
            assert_eq!(terminal.table.as_deref(), Some("orders"));
            assert_eq!(terminal.column.as_deref(), Some("amount"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn star_without_schema_is_unknown_and_with_schema_resolves() {
    let sql = "SELECT * FROM users JOIN orders ON users.id = orders.user_id";

    assert!(matches!(traced(sql, "email"), TraceResult::NotFound(_)));

    let schema = Schema::from_json(r#"{"users": {"id": "INT", "email": "VARCHAR"}, "orders": {"user_id": "INT"}}"#)
        .unwrap();
    match trace(&query(sql, &schema), "email", &TraceOptions::default()) {
        TraceResult::FoundInOutput(found) => {
            let terminal = found.graph.nodes.last().unwrap();
            assert_eq!(terminal.name, "users.email");
            assert_eq!(terminal.kind, NodeKind::Table);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn output_column_is_never_reported_in_cte() {
    // customer_id exists in both CTEs and the final SELECT
    match traced(PIPELINE, "customer_id") {
        TraceResult::FoundInOutput(found) => assert_eq!(found.graph.source_tables, vec!["customers"]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn cte_only_column_lists_every_cte() {
    match traced(PIPELINE, "amount") {
        TraceResult::FoundInCte(found) => {
            assert!(!found.in_final_output);
            assert_eq!(found.available_ctes, vec!["customer_orders", "totals"]);
            assert_eq!(found.found_in.len(), 1);
            assert_eq!(found.found_in[0].cte_name, "customer_orders");
            assert_eq!(found.found_in[0].sources, vec!["orders.amount"]);
        }
        other => panic!("unexpected {:?}", other),
    }

    let sql = "WITH a AS (SELECT status FROM orders), b AS (SELECT status FROM returns) SELECT 1 AS one FROM a, b";
    match traced(sql, "status") {
        TraceResult::FoundInCte(found) => {
            let ctes: Vec<&str> = found.found_in.iter().map(|m| m.cte_name.as_str()).collect();
            assert_eq!(ctes, vec!["a", "b"]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn missing_column_returns_hints() {
    match traced(PIPELINE, "lifetime_value") {
        TraceResult::NotFound(missing) => {
            assert!(!missing.success);
            assert_eq!(missing.code, DiagnosticCode::TargetNotFound);
            assert_eq!(missing.available_in_output, vec!["customer_id", "email", "total_amount", "avg_order"]);
            assert_eq!(missing.available_ctes, vec!["customer_orders", "totals"]);
            assert!(!missing.hint.is_empty());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn depth_increases_along_every_edge() {
    match traced(PIPELINE, "avg_order") {
        TraceResult::FoundInOutput(found) => {
            let graph = &found.graph;
            assert_eq!(graph.nodes[0].depth, 0);
            for edge in &graph.edges {
                assert!(graph.nodes[edge.from].depth > graph.nodes[edge.to].depth);
            }
            assert_eq!(graph.source_tables, vec!["orders"]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn impact_counts_output_and_cte_columns() {
    let sql = "WITH status_counts AS (SELECT status, COUNT(*) AS n FROM orders GROUP BY status) \
               SELECT o.id, CASE WHEN o.status = 'shipped' THEN 1 ELSE 0 END AS is_shipped FROM orders o";
    let schema = Schema::new();

    match impact(&query(sql, &schema), "orders.status", &ImpactOptions::default()).unwrap() {
        ImpactResult::Impacted(report) => {
            assert_eq!(report.impact_summary.total_affected, 2);
            assert_eq!(report.impacted_output_columns[0].column, "is_shipped");
            assert_eq!(report.impacted_cte_columns[0].cte, "status_counts");
            assert_eq!(report.impacted_cte_columns[0].column, "status");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn impacted_outputs_trace_back_to_the_source() {
    let schema = Schema::new();
    let pipeline = query(PIPELINE, &schema);

    let report = match impact(&pipeline, "orders.amount", &ImpactOptions::default()).unwrap() {
        ImpactResult::Impacted(report) => report,
        other => panic!("unexpected {:?}", other),
    };

    let outputs: Vec<&str> = report.impacted_output_columns.iter().map(|c| c.column.as_str()).collect();
    assert_eq!(outputs, vec!["total_amount", "avg_order"]);

    let ctes: Vec<String> = report
        .impacted_cte_columns
        .iter()
        .map(|c| format!("{}.{}", c.cte, c.column))
        .collect();
    assert_eq!(ctes, vec!["customer_orders.amount", "totals.total_amount"]);

    for column in outputs {
        match trace(&pipeline, column, &TraceOptions::default()) {
            TraceResult::FoundInOutput(found) => {
                assert!(found.graph.nodes.iter().any(|n| n.name == "orders.amount"), "{}", column);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn union_arity_mismatch_is_fatal() {
    let schema = Schema::new();
    let err = LineageQuery::parse(&SqlParser::new(), "SELECT a, b FROM t1 UNION SELECT a, b, c FROM t2", &schema)
        .unwrap_err();

    assert_eq!(err.code(), DiagnosticCode::UnionArityMismatch);
    assert!(err.is_fatal());
}

#[test]
fn self_diff_is_empty() {
    let schema = Schema::new();
    let old = query(PIPELINE, &schema);
    let new = query(PIPELINE, &schema);

    let result = diff(&old, &new, "orders.amount", &DiffOptions::default()).unwrap();
    assert!(result.is_empty());
    assert_eq!(result.diff_summary.outputs_changed, 0);
}

#[test]
fn diff_rejects_summary_only() {
    let schema = Schema::new();
    let old = query(PIPELINE, &schema);
    let options = DiffOptions { summary_only: true, ..Default::default() };

    let err = diff(&old, &old, "orders.amount", &options).unwrap_err();
    assert!(matches!(err, LineageError::DiffModeConstraint { .. }));
}

#[test]
fn impact_result_serializes_summary() {
    let schema = Schema::new();
    let options = ImpactOptions { include_line_numbers: true, ..Default::default() };
    let result = impact(&query(PIPELINE, &schema), "customers.email", &options).unwrap();
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["success"], true);
    assert_eq!(json["impact_summary"]["total_affected"], 1);
    assert_eq!(json["impacted_output_columns"][0]["column"], "email");
    assert_eq!(json["impacted_output_columns"][0]["line_hint"], 11);
    assert_eq!(json["line_numbers"]["cte:totals"], 6);
}
