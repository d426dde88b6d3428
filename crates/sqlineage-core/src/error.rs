//! Lineage error kinds
//!
//! Parse failures and scope invariant violations (forward reference, cycle,
//! union arity) abort a request. Qualification and limit errors are turned
//! into structured `success: false` results by the engine.

use crate::diagnostic::{Diagnostic, DiagnosticCode, Location, Severity};

/// Every error the lineage pipeline can report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineageError {
    #[error("Parse error: {message}")]
    ParseFailure {
        message: String,
        line: Option<usize>,
        column: Option<usize>,
    },

    #[error("Unsupported statement: {0}")]
    UnsupportedStatement(String),

    #[error("CTE '{cte}' references '{name}', which is declared later in the same WITH clause")]
    ForwardReference { cte: String, name: String },

    #[error("UNION branches disagree on column count: branch 1 has {expected}, branch {branch} has {found}")]
    UnionArity {
        expected: usize,
        branch: usize,
        found: usize,
    },

    #[error("Unknown table or alias '{qualifier}' in reference '{reference}'")]
    UnknownTable {
        qualifier: String,
        reference: String,
        available: Vec<String>,
    },

    #[error("Column '{column}' not found in any visible source")]
    ColumnNotFound { column: String, searched: Vec<String> },

    #[error("Column '{column}' is ambiguous between {}", .candidates.join(", "))]
    AmbiguousColumn {
        column: String,
        candidates: Vec<String>,
    },

    #[error("Cycle detected while resolving '{node}' (recursive CTEs are not supported)")]
    CycleDetected { node: String },

    #[error("Lineage expansion exceeded the depth limit of {limit}")]
    DepthLimitExceeded { limit: usize },

    #[error("Lineage graph exceeded the limit of {limit} nodes")]
    GraphTooLarge { limit: usize },

    #[error("Diff mode needs full expressions and cannot be combined with {option}")]
    DiffModeConstraint { option: String },
}

impl LineageError {
    /// Stable diagnostic code for this error
    pub fn code(&self) -> DiagnosticCode {
        match self {
            Self::ParseFailure { .. } => DiagnosticCode::SqlParseError,
            Self::UnsupportedStatement(_) => DiagnosticCode::UnsupportedStatement,
            Self::ForwardReference { .. } => DiagnosticCode::ForwardReference,
            Self::UnionArity { .. } => DiagnosticCode::UnionArityMismatch,
            Self::UnknownTable { .. } => DiagnosticCode::UnknownTable,
            Self::ColumnNotFound { .. } => DiagnosticCode::ColumnNotFound,
            Self::AmbiguousColumn { .. } => DiagnosticCode::AmbiguousColumn,
            Self::CycleDetected { .. } => DiagnosticCode::CycleDetected,
            Self::DepthLimitExceeded { .. } => DiagnosticCode::DepthLimitExceeded,
            Self::GraphTooLarge { .. } => DiagnosticCode::GraphTooLarge,
            Self::DiffModeConstraint { .. } => DiagnosticCode::DiffModeConstraint,
        }
    }

    /// Remediation text shown next to the error
    pub fn hint(&self) -> String {
        match self {
            Self::ParseFailure { .. } => "Check SQL syntax and dialect setting.".to_string(),
            Self::UnsupportedStatement(_) => {
                "Only SELECT, CREATE TABLE ... AS SELECT and INSERT ... SELECT statements carry lineage.".to_string()
            }
            Self::ForwardReference { name, .. } => {
                format!("Move the definition of '{}' above the CTE that uses it.", name)
            }
            Self::UnionArity { .. } => {
                "Every branch of a UNION must select the same number of columns.".to_string()
            }
            Self::UnknownTable { available, .. } if !available.is_empty() => {
                format!("Visible tables and aliases: {}", available.join(", "))
            }
            Self::UnknownTable { .. } => "Check the table alias used as qualifier.".to_string(),
            Self::ColumnNotFound { .. } => {
                "Try providing a schema with --schema for queries with SELECT * or unqualified columns.".to_string()
            }
            Self::AmbiguousColumn { candidates, .. } => format!(
                "Qualify the column with one of {} or supply a schema with --schema.",
                candidates.join(", ")
            ),
            Self::CycleDetected { .. } => {
                "Recursive CTEs are not supported; trace the non-recursive part instead.".to_string()
            }
            Self::DepthLimitExceeded { .. } | Self::GraphTooLarge { .. } => {
                "Raise [limits] in sqlineage.toml or analyze a smaller query.".to_string()
            }
            Self::DiffModeConstraint { .. } => {
                "Run diff without --summary-only and --max-expr-length.".to_string()
            }
        }
    }

    /// Whether the error aborts the whole request
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ParseFailure { .. }
                | Self::UnsupportedStatement(_)
                | Self::ForwardReference { .. }
                | Self::UnionArity { .. }
                | Self::CycleDetected { .. }
                | Self::DiffModeConstraint { .. }
        )
    }

    /// Names worth listing next to the error
    pub fn related(&self) -> Vec<String> {
        match self {
            Self::UnknownTable { available, .. } => available.clone(),
            Self::ColumnNotFound { searched, .. } => searched.clone(),
            Self::AmbiguousColumn { candidates, .. } => candidates.clone(),
            _ => Vec::new(),
        }
    }

    /// Convert into a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let severity = match self {
            Self::AmbiguousColumn { .. } => Severity::Warn,
            _ => Severity::Error,
        };

        let mut diagnostic = Diagnostic::new(self.code(), severity, self.to_string())
            .with_hint(self.hint())
            .with_related(self.related());

        if let Self::ParseFailure { line: Some(line), column, .. } = self {
            let location = match column {
                Some(column) => Location::position(*line, *column),
                None => Location::line(*line),
            };
            diagnostic = diagnostic.with_location(location);
        }

        diagnostic
    }
}
