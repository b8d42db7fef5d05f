// ABOUTME: Table identity, column metadata and primary-key shards
// ABOUTME: Shared by the fetch and verify pipelines

pub mod catalog;
pub mod split;

use crate::datum::Datum;
use crate::dbconn::Dialect;
use std::fmt;

pub use catalog::{diff_tables, load_tables, NameFilter, Table, TableDiff};
pub use split::split_table;

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Name used for blob-store prefixes and log fields, e.g. `public.users`.
    pub fn safe_string(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Quoted name for use in SQL against the given dialect.
    ///
    /// MySQL tables are addressed inside the connection's database, so only
    /// the table part is used there.
    pub fn qualified(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::MySql => dialect.quote_ident(&self.table),
            Dialect::Postgres | Dialect::CockroachDb => format!(
                "{}.{}",
                dialect.quote_ident(&self.schema),
                dialect.quote_ident(&self.table)
            ),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// A table present on both sides with compatible primary keys.
///
/// `columns` lists the primary-key columns first, in key order, followed by
/// every other column both sides share. Every scan selects columns in this
/// order, so the first `pk_len()` datums of any row are its key.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedTable {
    pub name: TableName,
    pub columns: Vec<String>,
    pub pk_columns: Vec<String>,
    pub source_types: Vec<String>,
    pub target_types: Vec<String>,
}

impl VerifiedTable {
    pub fn pk_len(&self) -> usize {
        self.pk_columns.len()
    }

    /// The key prefix of a row selected in `columns` order.
    pub fn pk_of<'a>(&self, row: &'a [Datum]) -> &'a [Datum] {
        &row[..self.pk_len().min(row.len())]
    }

    pub fn quoted_columns(&self, dialect: Dialect) -> Vec<String> {
        self.columns.iter().map(|c| dialect.quote_ident(c)).collect()
    }

    pub fn quoted_pk_columns(&self, dialect: Dialect) -> Vec<String> {
        self.pk_columns.iter().map(|c| dialect.quote_ident(c)).collect()
    }
}

/// Which side of a migration a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl VerifiedTable {
    pub fn types_for(&self, side: Side) -> &[String] {
        match side {
            Side::Source => &self.source_types,
            Side::Target => &self.target_types,
        }
    }
}

/// A primary-key range of a table: `[start_pk, end_pk)`.
///
/// Empty bounds are open-ended. Bounds may cover only a prefix of the key.
#[derive(Debug, Clone, PartialEq)]
pub struct TableShard {
    pub table: VerifiedTable,
    pub start_pk: Vec<Datum>,
    pub end_pk: Vec<Datum>,
    pub shard_num: usize,
    pub total_shards: usize,
}

impl TableShard {
    /// A single shard spanning the whole table.
    pub fn whole(table: VerifiedTable) -> Self {
        Self {
            table,
            start_pk: Vec::new(),
            end_pk: Vec::new(),
            shard_num: 1,
            total_shards: 1,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_names() {
        let name = TableName::new("public", "users");
        assert_eq!(name.qualified(Dialect::Postgres), "\"public\".\"users\"");
        assert_eq!(name.qualified(Dialect::MySql), "`users`");
        assert_eq!(name.safe_string(), "public.users");
    }

    #[test]
    fn test_pk_prefix() {
        let table = testutil::users_table();
        let row = vec![Datum::Int(4), Datum::Text("ann".to_string())];
        assert_eq!(table.pk_of(&row), &[Datum::Int(4)]);
    }
}
