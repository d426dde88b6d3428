//! Externally supplied table schemas and the shallow display type system

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};

/// Data type inferred for an output column
///
/// Inference is shallow and exists for display only; nothing in the lineage
/// engine depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InferredType {
    /// Integer result of counting (COUNT, ROW_NUMBER, RANK)
    Bigint,

    /// Integer result of date arithmetic or EXTRACT
    Integer,

    /// Exact numeric (SUM, arithmetic)
    Numeric,

    /// Floating point (AVG)
    Double,

    /// Decimal literal
    Decimal,

    /// Predicate result
    Boolean,

    /// String result
    Varchar,

    /// Date/time result
    Timestamp,

    /// Same type as the input (MIN, MAX, COALESCE)
    Inherited,

    /// CASE expression without a literal type hint
    Conditional,

    /// Type declared by a CAST or by the supplied schema
    Declared(String),

    /// Cannot infer
    Unknown,
}

impl std::fmt::Display for InferredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bigint => write!(f, "BIGINT"),
            Self::Integer => write!(f, "INTEGER"),
            Self::Numeric => write!(f, "NUMERIC"),
            Self::Double => write!(f, "DOUBLE"),
            Self::Decimal => write!(f, "DECIMAL"),
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Varchar => write!(f, "VARCHAR"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::Inherited => write!(f, "INHERITED"),
            Self::Conditional => write!(f, "CONDITIONAL"),
            Self::Declared(name) => write!(f, "{}", name.to_uppercase()),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl Serialize for InferredType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Mapping from table name to its columns and declared types
///
/// Deserializes from `{"users": {"id": "INT", "email": "VARCHAR"}}`.
/// Column order is preserved so `SELECT *` expands in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    tables: IndexMap<String, IndexMap<String, String>>,
}

/// Borrowed view of one table in a [`Schema`]
#[derive(Debug, Clone, Copy)]
pub struct TableSchema<'a> {
    /// Table name as declared in the schema
    pub name: &'a str,

    columns: &'a IndexMap<String, String>,
}

impl Schema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a schema from its JSON representation
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Add (or replace) a table
    pub fn add_table<I, K, V>(&mut self, name: impl Into<String>, columns: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let columns = columns
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.tables.insert(name.into(), columns);
    }

    /// Builder-style variant of [`Schema::add_table`]
    pub fn with_table<I, K, V>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.add_table(name, columns);
        self
    }

    /// Merge another schema over this one; tables in `other` win
    pub fn merge(&mut self, other: Schema) {
        for (name, columns) in other.tables {
            self.tables.insert(name, columns);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Names of all declared tables
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|k| k.as_str()).collect()
    }

    /// Look up a table case-insensitively.
    ///
    /// A dotted name (`analytics.users`) falls back to its last segment, and
    /// a bare name matches a dotted schema key by its last segment.
    pub fn table(&self, name: &str) -> Option<TableSchema<'_>> {
        let found = self
            .tables
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .or_else(|| {
                let last = last_segment(name);
                self.tables
                    .iter()
                    .find(|(key, _)| last_segment(key).eq_ignore_ascii_case(last))
            });

        found.map(|(key, columns)| TableSchema { name: key.as_str(), columns })
    }

    /// Declared type of `table.column`, if known
    pub fn column_type(&self, table: &str, column: &str) -> Option<&str> {
        self.table(table).and_then(|t| t.column_type(column))
    }
}

impl<'a> TableSchema<'a> {
    /// Column names in declaration order
    pub fn column_names(&self) -> Vec<&'a str> {
        self.columns.keys().map(|k| k.as_str()).collect()
    }

    /// Whether the table declares `column` (case-insensitive)
    pub fn declares(&self, column: &str) -> bool {
        self.column_type(column).is_some()
    }

    pub fn column_type(&self, column: &str) -> Option<&'a str> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, ty)| ty.as_str())
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inferred_type_display() {
        assert_eq!(InferredType::Bigint.to_string(), "BIGINT");
        assert_eq!(InferredType::Declared("varchar".into()).to_string(), "VARCHAR");
        assert_eq!(
            serde_json::to_string(&InferredType::Inherited).unwrap(),
            "\"INHERITED\""
        );
    }

    #[test]
    fn schema_from_json_preserves_column_order() {
        let schema = Schema::from_json(r#"{"users": {"id": "INT", "name": "VARCHAR", "email": "VARCHAR"}}"#)
            .unwrap();

        let users = schema.table("users").unwrap();
        assert_eq!(users.column_names(), vec!["id", "name", "email"]);
        assert!(users.declares("EMAIL"));
        assert!(!users.declares("missing"));
    }

    #[test]
    fn table_lookup_is_case_insensitive_and_segment_aware() {
        let schema = Schema::new()
            .with_table("analytics.Orders", [("status", "VARCHAR")])
            .with_table("users", [("id", "INT")]);

        assert!(schema.table("ORDERS").is_some());
        assert!(schema.table("analytics.orders").is_some());
        assert!(schema.table("raw.users").is_some());
        assert!(schema.table("payments").is_none());
        assert_eq!(schema.column_type("orders", "STATUS"), Some("VARCHAR"));
    }

    #[test]
    fn merge_replaces_tables() {
        let mut base = Schema::new().with_table("t", [("a", "INT")]);
        base.merge(Schema::new().with_table("t", [("b", "INT")]));

        let t = base.table("t").unwrap();
        assert_eq!(t.column_names(), vec!["b"]);
    }
}
