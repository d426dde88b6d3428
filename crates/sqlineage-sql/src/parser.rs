//! SQL parsing using datafusion-sqlparser-rs
//!
//! Parses SQL into AST and locates the query that carries lineage.

use regex::Regex;
use serde::Serialize;
use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::{
    BigQueryDialect, Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, RedshiftSqlDialect,
    SnowflakeDialect,
};
use sqlparser::parser::{Parser, ParserError};
use sqlineage_core::{DialectConfig, LineageError};
use std::sync::OnceLock;

/// SQL parser with configurable dialect
pub struct SqlParser {
    dialect: Box<dyn Dialect>,
    config: DialectConfig,
}

impl SqlParser {
    /// Create a new SQL parser with the default (generic) dialect
    pub fn new() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
            config: DialectConfig::Ansi,
        }
    }

    /// Create a SQL parser for BigQuery
    pub fn bigquery() -> Self {
        Self {
            dialect: Box::new(BigQueryDialect {}),
            config: DialectConfig::BigQuery,
        }
    }

    /// Create a SQL parser for PostgreSQL
    pub fn postgres() -> Self {
        Self {
            dialect: Box::new(PostgreSqlDialect {}),
            config: DialectConfig::Postgres,
        }
    }

    /// Create a SQL parser for Snowflake
    pub fn snowflake() -> Self {
        Self {
            dialect: Box::new(SnowflakeDialect {}),
            config: DialectConfig::Snowflake,
        }
    }

    /// Create a SQL parser for Redshift
    pub fn redshift() -> Self {
        Self {
            dialect: Box::new(RedshiftSqlDialect {}),
            config: DialectConfig::Redshift,
        }
    }

    /// Create a SQL parser for MySQL
    pub fn mysql() -> Self {
        Self {
            dialect: Box::new(MySqlDialect {}),
            config: DialectConfig::MySql,
        }
    }

    /// Create a parser from a dialect config
    pub fn from_dialect(dialect: &DialectConfig) -> Self {
        match dialect {
            DialectConfig::BigQuery => Self::bigquery(),
            DialectConfig::Snowflake => Self::snowflake(),
            DialectConfig::Postgres => Self::postgres(),
            DialectConfig::Redshift => Self::redshift(),
            DialectConfig::MySql => Self::mysql(),
            DialectConfig::Ansi => Self::new(),
        }
    }

    /// Dialect this parser was built for
    pub fn dialect(&self) -> DialectConfig {
        self.config
    }

    /// Parse SQL string into AST
    pub fn parse(&self, sql: &str) -> Result<ParsedSql, ParseError> {
        let statements =
            Parser::parse_sql(&*self.dialect, sql).map_err(|error| ParseError { error })?;

        Ok(ParsedSql {
            sql: sql.to_string(),
            statements,
            dialect: self.config,
        })
    }

    /// Parse SQL and return a lineage error on failure
    pub fn parse_lineage(&self, sql: &str) -> Result<ParsedSql, LineageError> {
        self.parse(sql).map_err(|e| e.to_lineage_error())
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Statement shapes that carry lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Select,
    CreateTableAsSelect,
    InsertSelect,
}

/// The query inside a lineage-bearing statement
#[derive(Debug, Clone)]
pub struct LineageStatement<'a> {
    pub kind: StatementKind,
    pub query: &'a Query,

    /// Table created by `CREATE TABLE ... AS SELECT`
    pub target_table: Option<String>,
}

/// Successfully parsed SQL with AST
#[derive(Debug, Clone)]
pub struct ParsedSql {
    /// Original SQL string
    pub sql: String,

    /// Parsed statements
    pub statements: Vec<Statement>,

    pub dialect: DialectConfig,
}

impl ParsedSql {
    /// Get the first statement
    pub fn first_statement(&self) -> Option<&Statement> {
        self.statements.first()
    }

    /// Check if this is a SELECT statement
    pub fn is_select(&self) -> bool {
        matches!(self.first_statement(), Some(Statement::Query(_)))
    }

    /// Count the number of statements
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Locate the query of the first statement
    pub fn lineage_statement(&self) -> Result<LineageStatement<'_>, LineageError> {
        let statement = self.first_statement().ok_or_else(|| LineageError::ParseFailure {
            message: "No SQL statement found".to_string(),
            line: None,
            column: None,
        })?;

        if self.statements.len() > 1 {
            tracing::debug!(
                statements = self.statements.len(),
                "multiple statements, using the first"
            );
        }

        match statement {
            Statement::Query(query) => Ok(LineageStatement {
                kind: StatementKind::Select,
                query,
                target_table: None,
            }),
            Statement::CreateTable(create) => match &create.query {
                Some(query) => Ok(LineageStatement {
                    kind: StatementKind::CreateTableAsSelect,
                    query,
                    target_table: create.name.0.last().map(|ident| ident.value.clone()),
                }),
                None => Err(LineageError::UnsupportedStatement(
                    "CREATE TABLE without AS SELECT".to_string(),
                )),
            },
            Statement::Insert(insert) => match &insert.source {
                Some(query) => Ok(LineageStatement {
                    kind: StatementKind::InsertSelect,
                    query,
                    target_table: None,
                }),
                None => Err(LineageError::UnsupportedStatement(
                    "INSERT without SELECT".to_string(),
                )),
            },
            other => Err(LineageError::UnsupportedStatement(statement_keyword(other))),
        }
    }
}

/// Leading keywords of a statement, for error messages
fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// SQL parsing error
#[derive(Debug)]
pub struct ParseError {
    /// Parser error from sqlparser
    pub error: ParserError,
}

impl ParseError {
    /// Line and column reported by the tokenizer or parser
    pub fn position(&self) -> Option<(usize, usize)> {
        static POSITION: OnceLock<Option<Regex>> = OnceLock::new();
        let re = POSITION
            .get_or_init(|| Regex::new(r"Line: (\d+), Column:? (\d+)").ok())
            .as_ref()?;

        let message = self.error.to_string();
        let caps = re.captures(&message)?;
        let line = caps.get(1)?.as_str().parse().ok()?;
        let column = caps.get(2)?.as_str().parse().ok()?;
        Some((line, column))
    }

    pub fn to_lineage_error(&self) -> LineageError {
        let (line, column) = match self.position() {
            Some((line, column)) => (Some(line), Some(column)),
            None => (None, None),
        };

        LineageError::ParseFailure {
            message: self.error.to_string(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SQL parse error: {}", self.error)
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlineage_core::DiagnosticCode;

    #[test]
    fn parse_simple_select() {
        let parser = SqlParser::new();
        let parsed = parser.parse("SELECT id, name FROM users WHERE active = true").unwrap();

        assert_eq!(parsed.statement_count(), 1);
        assert!(parsed.is_select());
        assert_eq!(parsed.lineage_statement().unwrap().kind, StatementKind::Select);
    }

    #[test]
    fn parse_invalid_sql_reports_position() {
        let parser = SqlParser::new();
        let error = parser.parse("SELECT id\nFROM users WHERE )").unwrap_err();

        assert_eq!(error.position().map(|(line, _)| line), Some(2));

        let lineage = error.to_lineage_error();
        assert_eq!(lineage.code(), DiagnosticCode::SqlParseError);
        assert!(matches!(lineage, LineageError::ParseFailure { line: Some(2), .. }));

        let diagnostic = lineage.to_diagnostic();
        assert_eq!(diagnostic.location.map(|location| location.line), Some(Some(2)));
    }

    #[test]
    fn create_table_as_select_has_target() {
        let parser = SqlParser::new();
        let parsed = parser
            .parse("CREATE TABLE analytics.summary AS SELECT id FROM users")
            .unwrap();

        let statement = parsed.lineage_statement().unwrap();
        assert_eq!(statement.kind, StatementKind::CreateTableAsSelect);
        assert_eq!(statement.target_table.as_deref(), Some("summary"));
    }

    #[test]
    fn insert_select_is_accepted() {
        let parser = SqlParser::new();
        let parsed = parser
            .parse("INSERT INTO archive SELECT id, email FROM users")
            .unwrap();

        let statement = parsed.lineage_statement().unwrap();
        assert_eq!(statement.kind, StatementKind::InsertSelect);
        assert_eq!(statement.target_table, None);
    }

    #[test]
    fn ddl_is_unsupported() {
        let parser = SqlParser::new();
        let parsed = parser.parse("DROP TABLE users").unwrap();

        let err = parsed.lineage_statement().unwrap_err();
        assert!(matches!(err, LineageError::UnsupportedStatement(ref s) if s == "DROP TABLE"));
    }

    #[test]
    fn different_dialects() {
        let sql = "SELECT id FROM users";
        for dialect in [
            DialectConfig::Ansi,
            DialectConfig::BigQuery,
            DialectConfig::Postgres,
            DialectConfig::Snowflake,
            DialectConfig::Redshift,
            DialectConfig::MySql,
        ] {
            let parser = SqlParser::from_dialect(&dialect);
            assert_eq!(parser.dialect(), dialect);
            assert!(parser.parse(sql).is_ok(), "{} failed", dialect);
        }
    }
}
