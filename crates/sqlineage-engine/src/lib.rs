//! sqlineage engine - lineage over a qualified scope tree
//!
//! This crate implements:
//! - The column lineage graph and its memoized builder
//! - Forward lineage of a single column (trace)
//! - Reverse lineage of a source column (impact)
//! - Impact diff between two versions of a query

pub mod graph;
pub mod expand;
pub mod query;
pub mod trace;
pub mod impact;
pub mod diff;

pub use graph::{LineageGraph, LineageNode, LineageEdge, NodeId, NodeKey, NodeKind};
pub use expand::{GraphBuilder, OnFailure};
pub use query::LineageQuery;
pub use trace::{
    trace, TraceOptions, TraceResult, OutputTrace, CteTrace, TraceNotFound, TraceFailure, TraceGraph, TraceNode,
    TraceEdge, CteMatch,
};
pub use impact::{
    impact, ImpactOptions, ImpactResult, ImpactReport, ImpactFailure, ImpactSummary, ImpactedOutput,
    ImpactedCteColumn, ImpactGraph, ImpactNodeKind,
};
pub use diff::{diff, DiffOptions, DiffResult, DiffSummary, DiffGraphs, ColumnChanges, ChangedColumn};
