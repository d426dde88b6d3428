//! SQL parsing and scope analysis
//!
//! This crate handles:
//! - Parsing SQL using datafusion-sqlparser-rs
//! - Partitioning a query into lexical scopes (root, CTE, subquery, UNION branch)
//! - Qualifying every column reference to its source
//! - Shallow type inference and transformation classification
//! - Structural reports (analyze, CTE listing, table extraction, qualification)
//! - Locating CTE definitions and the final SELECT by line

pub mod parser;
pub mod scope;
pub mod expr;
pub mod builder;
pub mod qualify;
pub mod inference;
pub mod analyze;
pub mod lines;

pub use parser::{SqlParser, ParsedSql, ParseError, StatementKind, LineageStatement};
pub use scope::{
    Scope, ScopeId, ScopeKind, ScopeTree, Source, SourceKind, OutputColumn, ColumnDef, ColumnRef,
    ColumnTarget, Resolution, ResolvedColumn, QualificationState, Transformation, AggregationInfo,
    Clause,
};
pub use builder::{build_scopes, ScopeBuilder, UNKNOWN_SOURCE};
pub use qualify::{build_qualified_scopes, qualify_tree, Qualifier, Lateral};
pub use analyze::{
    analyze, list_ctes, extract_tables, qualify_report, truncate_expr, AnalyzeOptions, AnalyzeResult,
    CteListing, TableListing, QualifyReport, QueryType,
};
pub use lines::{find_line_numbers, cte_key, FINAL_SELECT};
