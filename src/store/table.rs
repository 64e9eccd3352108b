//! Postgres identifier helpers for the books table.

use crate::error::{Error, Result};

/// Fully-qualified table name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Rejects blank schema or table names; quoting happens at render time.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() {
            return Err(Error::invalid("schema name is required"));
        }
        if table.trim().is_empty() {
            return Err(Error::invalid("table name is required"));
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Quoted, schema-unique name for an index on this table.
    pub fn index_name(&self, suffix: &str) -> String {
        quote_ident(&format!(
            "{}_{}_{}",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table),
            suffix
        ))
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "books".to_string(),
        }
    }
}

/// Quotes a Postgres identifier, doubling embedded quotes.
fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_hostile_identifiers() {
        let table = TableName::new("public", "bo\"oks").unwrap();
        assert_eq!(table.qualified(), "\"public\".\"bo\"\"oks\"");
        assert_eq!(table.index_name("title_gin"), "\"public_bo_oks_title_gin\"");
    }

    #[test]
    fn rejects_blank_names() {
        assert!(TableName::new("", "books").is_err());
        assert!(TableName::new("public", "  ").is_err());
    }
}
