//! Diagnostic codes and error reporting
//!
//! IMPORTANT: Diagnostic codes are versioned and stable.
//! NEVER rename or remove codes - they are part of the public API.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};

/// Diagnostic code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Parsing (1xxx)
    /// Failed to parse SQL
    SqlParseError,

    /// Statement kind has no SELECT to analyze
    UnsupportedStatement,

    // Scope construction (2xxx)
    /// CTE references a CTE declared later in the same WITH clause
    ForwardReference,

    /// UNION branches produce different column counts
    UnionArityMismatch,

    /// CTE references itself (recursive CTEs are unsupported)
    CycleDetected,

    // Qualification (3xxx)
    /// Qualifier does not name any visible table or alias
    UnknownTable,

    /// Column is not provided by any visible source
    ColumnNotFound,

    /// Column is provided by more than one visible source
    AmbiguousColumn,

    /// SELECT * encountered but cannot expand (no schema)
    SelectStarUnexpandable,

    // Graph limits (4xxx)
    /// Expansion went deeper than the configured limit
    DepthLimitExceeded,

    /// Lineage graph grew past the configured node limit
    GraphTooLarge,

    // Requests (5xxx)
    /// Diff was combined with an option that drops expression text
    DiffModeConstraint,

    /// Requested column was not found in the query
    TargetNotFound,

    // General warnings (9xxx)
    /// General informational message
    Info,

    /// General warning message
    Warning,
}

impl DiagnosticCode {
    /// Get the diagnostic code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlParseError => "SQL_PARSE_ERROR",
            Self::UnsupportedStatement => "UNSUPPORTED_STATEMENT",
            Self::ForwardReference => "FORWARD_REFERENCE",
            Self::UnionArityMismatch => "UNION_ARITY_MISMATCH",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::UnknownTable => "UNKNOWN_TABLE",
            Self::ColumnNotFound => "COLUMN_NOT_FOUND",
            Self::AmbiguousColumn => "AMBIGUOUS_COLUMN",
            Self::SelectStarUnexpandable => "SELECT_STAR_UNEXPANDABLE",
            Self::DepthLimitExceeded => "DEPTH_LIMIT_EXCEEDED",
            Self::GraphTooLarge => "GRAPH_TOO_LARGE",
            Self::DiffModeConstraint => "DIFF_MODE_CONSTRAINT",
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,

    /// Warning - result is usable but incomplete
    Warn,

    /// Error - the request could not be answered
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Position inside the analyzed SQL text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Line number (1-indexed)
    pub line: Option<usize>,

    /// Column number (1-indexed)
    pub column: Option<usize>,
}

impl Location {
    /// Location of a line
    pub fn line(line: usize) -> Self {
        Self { line: Some(line), column: None }
    }

    /// Location of a line and column
    pub fn position(line: usize, column: usize) -> Self {
        Self { line: Some(line), column: Some(column) }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: DiagnosticCode,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Source location (best-effort)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Remediation hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Names the diagnostic is about (candidate sources, available columns)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with minimal fields
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            location: None,
            hint: None,
            related: Vec::new(),
        }
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set the remediation hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Set related names
    pub fn with_related(mut self, related: Vec<String>) -> Self {
        self.related = related;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_code_stability() {
        assert_eq!(DiagnosticCode::ForwardReference.as_str(), "FORWARD_REFERENCE");
        assert_eq!(DiagnosticCode::SelectStarUnexpandable.as_str(), "SELECT_STAR_UNEXPANDABLE");
        assert_eq!(
            serde_json::to_string(&DiagnosticCode::UnionArityMismatch).unwrap(),
            "\"UNION_ARITY_MISMATCH\""
        );
    }

    #[test]
    fn diagnostic_serialization() {
        let diag = Diagnostic::new(
            DiagnosticCode::AmbiguousColumn,
            Severity::Warn,
            "Column 'id' is ambiguous",
        )
        .with_location(Location::position(3, 12))
        .with_hint("Qualify the column with a table alias")
        .with_related(vec!["users".to_string(), "orders".to_string()]);

        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("AMBIGUOUS_COLUMN"));
        assert!(json.contains("\"severity\":\"warn\""));
        assert!(json.contains("\"line\":3"));
        assert!(!json.contains("\"file\""));
    }
}
