//! Column metadata inference
//!
//! Classifies how each output column transforms its inputs and infers a
//! shallow display type. Nothing here affects lineage resolution.

use sqlparser::ast::{BinaryOperator, Expr, Function, UnaryOperator, Value};
use sqlineage_core::InferredType;
use crate::expr::{self, function_name, has_wildcard_arg, unwrap_nested};
use crate::scope::{AggregationInfo, Transformation};

/// Aggregate function names
const AGGREGATES: &[&str] = &[
    "COUNT",
    "SUM",
    "AVG",
    "MIN",
    "MAX",
    "STDDEV",
    "VARIANCE",
    "ARRAY_AGG",
    "STRING_AGG",
    "LISTAGG",
    "PERCENTILE_CONT",
    "PERCENTILE_DISC",
];

const STRING_FUNCTIONS: &[&str] = &[
    "CONCAT", "SUBSTRING", "SUBSTR", "UPPER", "LOWER", "TRIM", "LTRIM", "RTRIM", "REPLACE",
];

const RANKING_FUNCTIONS: &[&str] = &["ROW_NUMBER", "RANK", "DENSE_RANK", "NTILE"];

/// Whether `func` is an aggregate call (not a window function)
pub fn is_aggregate(func: &Function) -> bool {
    func.over.is_none() && AGGREGATES.contains(&function_name(func).as_str())
}

/// Whether the expression contains an aggregate call outside windows
pub fn contains_aggregate(expr: &Expr) -> bool {
    expr::any(expr, |node| matches!(node, Expr::Function(func) if is_aggregate(func)))
}

/// Classify how a projection item transforms its input
pub fn classify(expr: &Expr, alias: Option<&str>) -> Transformation {
    match unwrap_nested(expr) {
        Expr::Identifier(ident) => column_classification(&ident.value, alias),
        Expr::CompoundIdentifier(idents) => match idents.last() {
            Some(last) => column_classification(&last.value, alias),
            None => Transformation::Derived,
        },
        Expr::Function(func) if func.over.is_some() => Transformation::WindowFunction,
        Expr::Function(func) if is_aggregate(func) => Transformation::Aggregated,
        _ => Transformation::Derived,
    }
}

fn column_classification(column: &str, alias: Option<&str>) -> Transformation {
    match alias {
        Some(alias) if !alias.eq_ignore_ascii_case(column) => Transformation::Renamed,
        _ => Transformation::Passthrough,
    }
}

/// Aggregation detail: the aggregate itself, or `DERIVED` listing the
/// aggregates an expression combines
pub fn aggregation(expr: &Expr) -> Option<AggregationInfo> {
    let expr = unwrap_nested(expr);

    if let Expr::Function(func) = expr {
        if is_aggregate(func) {
            return Some(aggregate_info(func));
        }
    }

    let mut found = Vec::new();
    expr::walk(expr, &mut |node| {
        if let Expr::Function(func) = node {
            if func.over.is_some() {
                return false;
            }
            if is_aggregate(func) {
                found.push(aggregate_info(func));
                return false;
            }
        }
        true
    });

    if found.is_empty() {
        None
    } else {
        Some(AggregationInfo {
            function: "DERIVED".to_string(),
            input_columns: Vec::new(),
            contains: found,
        })
    }
}

fn aggregate_info(func: &Function) -> AggregationInfo {
    let name = function_name(func);
    let mut input_columns = Vec::new();

    for arg in expr::function_args(func) {
        for column_ref in expr::collect_parts(arg).refs {
            let display = column_ref.display_name();
            if !input_columns.contains(&display) {
                input_columns.push(display);
            }
        }
    }

    if input_columns.is_empty() && name == "COUNT" && (has_wildcard_arg(func) || expr::function_args(func).is_empty()) {
        input_columns.push("*".to_string());
    }

    AggregationInfo {
        function: name,
        input_columns,
        contains: Vec::new(),
    }
}

/// Infer a display type. `lookup` maps `(qualifier, column)` to a declared type.
pub fn infer_type(expr: &Expr, lookup: &dyn Fn(Option<&str>, &str) -> Option<String>) -> InferredType {
    match unwrap_nested(expr) {
        Expr::Cast { data_type, .. } => InferredType::Declared(data_type.to_string()),
        Expr::Function(func) => function_type(func),
        Expr::BinaryOp { op, .. } => match op {
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::And
            | BinaryOperator::Or => InferredType::Boolean,
            BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo => InferredType::Numeric,
            BinaryOperator::StringConcat => InferredType::Varchar,
            _ => InferredType::Unknown,
        },
        Expr::UnaryOp { op: UnaryOperator::Not, .. }
        | Expr::InList { .. }
        | Expr::InSubquery { .. }
        | Expr::Between { .. }
        | Expr::Like { .. }
        | Expr::ILike { .. }
        | Expr::IsNull(_)
        | Expr::IsNotNull(_)
        | Expr::Exists { .. } => InferredType::Boolean,
        Expr::Substring { .. } | Expr::Trim { .. } => InferredType::Varchar,
        Expr::Extract { .. } => InferredType::Integer,
        Expr::Case { results, .. } => match results.first().map(unwrap_nested) {
            Some(Expr::Value(Value::SingleQuotedString(_))) => InferredType::Varchar,
            Some(Expr::Value(Value::Number(_, _))) => InferredType::Numeric,
            _ => InferredType::Conditional,
        },
        Expr::Identifier(ident) => lookup(None, &ident.value)
            .map(InferredType::Declared)
            .unwrap_or(InferredType::Unknown),
        Expr::CompoundIdentifier(idents) => match expr::compound_ref(idents) {
            Some(column_ref) => lookup(column_ref.qualifier.as_deref(), &column_ref.column)
                .map(InferredType::Declared)
                .unwrap_or(InferredType::Unknown),
            None => InferredType::Unknown,
        },
        Expr::Value(value) => literal_type(value),
        _ => InferredType::Unknown,
    }
}

fn function_type(func: &Function) -> InferredType {
    let name = function_name(func);

    if func.over.is_some() {
        return match name.as_str() {
            "COUNT" => InferredType::Bigint,
            "SUM" => InferredType::Numeric,
            "AVG" => InferredType::Double,
            n if RANKING_FUNCTIONS.contains(&n) => InferredType::Bigint,
            _ => InferredType::Inherited,
        };
    }

    match name.as_str() {
        "COUNT" => InferredType::Bigint,
        "SUM" => InferredType::Numeric,
        "AVG" => InferredType::Double,
        "MIN" | "MAX" | "COALESCE" | "NVL" | "IFNULL" => InferredType::Inherited,
        "CURRENT_DATE" | "CURRENT_TIMESTAMP" | "NOW" | "DATE_TRUNC" => InferredType::Timestamp,
        "DATEDIFF" | "DATE_DIFF" => InferredType::Integer,
        n if STRING_FUNCTIONS.contains(&n) => InferredType::Varchar,
        _ => InferredType::Unknown,
    }
}

fn literal_type(value: &Value) -> InferredType {
    match value {
        Value::Number(n, _) if n.contains('.') => InferredType::Decimal,
        Value::Number(_, _) => InferredType::Integer,
        Value::SingleQuotedString(_) | Value::DoubleQuotedString(_) => InferredType::Varchar,
        Value::Boolean(_) => InferredType::Boolean,
        _ => InferredType::Unknown,
    }
}
