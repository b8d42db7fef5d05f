// ABOUTME: Dialect-neutral database connection capability
// ABOUTME: One Conn implementation per dialect, selected once from the connection URL

pub mod mysql;
pub mod postgres;

use crate::datum::Datum;
use crate::error::MoltError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub use self::mysql::MySqlConn;
pub use self::postgres::PgConn;

/// A fetched row: one datum per selected column.
pub type Row = Vec<Datum>;

/// SQL dialects this crate can read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    CockroachDb,
    MySql,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "PostgreSQL",
            Dialect::CockroachDb => "CockroachDB",
            Dialect::MySql => "MySQL",
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::CockroachDb => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
        }
    }

    /// Quote a string literal for this dialect.
    ///
    /// MySQL's default sql_mode reads a backslash as an escape inside string
    /// literals, so backslashes are doubled there as well as quotes.
    pub fn quote_literal(&self, s: &str) -> String {
        match self {
            Dialect::MySql => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Dialect::Postgres | Dialect::CockroachDb => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// True for dialects spoken over the Postgres wire protocol.
    pub fn is_postgres_wire(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::CockroachDb)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface every dialect connection implements.
///
/// Callers pick a connection once at setup and never re-inspect its concrete
/// type, except through `as_postgres` / `as_mysql` on the few paths (COPY,
/// IMPORT, consistent snapshots) that need the native client.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Role label for logs, e.g. "source" or "target".
    fn id(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Whether this connection speaks the dialect IMPORT INTO targets.
    fn is_target_dialect(&self) -> bool {
        self.dialect() == Dialect::CockroachDb
    }

    /// Run a query and decode every column into a datum.
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Open a fresh connection to the same database with the same role label.
    async fn clone_conn(&self) -> Result<Arc<dyn Conn>>;

    fn as_postgres(&self) -> Option<&PgConn> {
        None
    }

    fn as_mysql(&self) -> Option<&MySqlConn> {
        None
    }
}

/// Require a Postgres-wire connection, failing fast otherwise.
pub fn require_postgres(conn: &dyn Conn) -> Result<&PgConn, MoltError> {
    conn.as_postgres().ok_or_else(|| MoltError::WrongDialect {
        expected: "postgres-wire",
        actual: conn.dialect().to_string(),
    })
}

/// Require a MySQL connection, failing fast otherwise.
pub fn require_mysql(conn: &dyn Conn) -> Result<&MySqlConn, MoltError> {
    conn.as_mysql().ok_or_else(|| MoltError::WrongDialect {
        expected: "mysql",
        actual: conn.dialect().to_string(),
    })
}

/// Connect to a database, selecting the dialect from the URL scheme.
///
/// `postgres://` and `postgresql://` URLs are checked with `SELECT version()`
/// to tell CockroachDB apart from PostgreSQL.
pub async fn connect(id: &str, url: &str) -> Result<Arc<dyn Conn>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let conn = PgConn::connect(id, url).await?;
        Ok(Arc::new(conn))
    } else if url.starts_with("mysql://") {
        let conn = MySqlConn::connect(id, url).await?;
        Ok(Arc::new(conn))
    } else {
        bail!(
            "Unsupported connection string for {}.\n\
             Expected a postgres://, postgresql:// or mysql:// URL",
            id
        )
    }
}
