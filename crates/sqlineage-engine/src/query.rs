//! Qualified query handed to the engine operations

use sqlineage_core::{LineageError, Schema};
use sqlineage_sql::{build_qualified_scopes, ParsedSql, ScopeTree, SqlParser};

/// SQL text together with its qualified scope tree
#[derive(Debug, Clone)]
pub struct LineageQuery<'a> {
    pub sql: &'a str,
    pub tree: ScopeTree,
    pub schema: &'a Schema,
}

impl<'a> LineageQuery<'a> {
    /// Build and qualify the scopes of the first statement
    pub fn from_parsed(parsed: &'a ParsedSql, schema: &'a Schema) -> Result<Self, LineageError> {
        let statement = parsed.lineage_statement()?;
        let tree = build_qualified_scopes(statement.query, schema)?;

        Ok(Self {
            sql: &parsed.sql,
            tree,
            schema,
        })
    }

    /// Parse `sql` and build the query. The parsed statements are dropped once
    /// the scope tree exists.
    pub fn parse(parser: &SqlParser, sql: &'a str, schema: &'a Schema) -> Result<Self, LineageError> {
        let parsed = parser.parse_lineage(sql)?;
        let statement = parsed.lineage_statement()?;
        let tree = build_qualified_scopes(statement.query, schema)?;

        Ok(Self { sql, tree, schema })
    }

    /// Names of every CTE, breadth-first
    pub fn cte_names(&self) -> Vec<String> {
        self.tree.cte_names()
    }
}
