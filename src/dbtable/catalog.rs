// ABOUTME: Loads table catalogs from information_schema and diffs source against target
// ABOUTME: Produces the verified tables both pipelines work on, plus name filtering

use super::{TableName, VerifiedTable};
use crate::datum::Datum;
use crate::dbconn::{Conn, Dialect};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;

/// A table as described by one side's catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: TableName,
    pub columns: Vec<Column>,
    pub pk_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

/// Load every base table with its columns and primary key.
///
/// MySQL tables are reported under the `public` schema, which is where they
/// land on a Postgres-wire target.
pub async fn load_tables(conn: &dyn Conn) -> Result<Vec<Table>> {
    let (columns_sql, pk_sql) = catalog_queries(conn.dialect());

    let column_rows = conn
        .query(&columns_sql)
        .await
        .with_context(|| format!("Failed to list columns on {}", conn.id()))?;
    let pk_rows = conn
        .query(&pk_sql)
        .await
        .with_context(|| format!("Failed to list primary keys on {}", conn.id()))?;

    let mut tables: BTreeMap<TableName, Table> = BTreeMap::new();
    for row in &column_rows {
        let name = TableName::new(text_at(row, 0), text_at(row, 1));
        tables
            .entry(name.clone())
            .or_insert_with(|| Table {
                name,
                columns: Vec::new(),
                pk_columns: Vec::new(),
            })
            .columns
            .push(Column {
                name: text_at(row, 2),
                type_name: text_at(row, 3).to_lowercase(),
            });
    }
    for row in &pk_rows {
        let name = TableName::new(text_at(row, 0), text_at(row, 1));
        if let Some(table) = tables.get_mut(&name) {
            table.pk_columns.push(text_at(row, 2));
        }
    }

    tracing::debug!(conn = conn.id(), tables = tables.len(), "loaded catalog");
    Ok(tables.into_values().collect())
}

fn catalog_queries(dialect: Dialect) -> (String, String) {
    match dialect {
        Dialect::MySql => (
            "SELECT 'public',
                CAST(c.TABLE_NAME AS CHAR(255)),
                CAST(c.COLUMN_NAME AS CHAR(255)),
                CAST(c.DATA_TYPE AS CHAR(255))
            FROM INFORMATION_SCHEMA.COLUMNS c
            JOIN INFORMATION_SCHEMA.TABLES t
                ON c.TABLE_SCHEMA = t.TABLE_SCHEMA AND c.TABLE_NAME = t.TABLE_NAME
            WHERE c.TABLE_SCHEMA = DATABASE() AND t.TABLE_TYPE = 'BASE TABLE'
            ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION"
                .to_string(),
            "SELECT 'public',
                CAST(TABLE_NAME AS CHAR(255)),
                CAST(COLUMN_NAME AS CHAR(255))
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = DATABASE() AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY TABLE_NAME, ORDINAL_POSITION"
                .to_string(),
        ),
        Dialect::Postgres | Dialect::CockroachDb => {
            let hidden = if dialect == Dialect::CockroachDb {
                "AND c.is_hidden = 'NO'"
            } else {
                ""
            };
            (
                format!(
                    "SELECT c.table_schema::TEXT, c.table_name::TEXT, c.column_name::TEXT, c.data_type::TEXT
                    FROM information_schema.columns c
                    JOIN information_schema.tables t
                        ON c.table_schema = t.table_schema AND c.table_name = t.table_name
                    WHERE t.table_type = 'BASE TABLE'
                        AND c.table_schema NOT IN ('pg_catalog', 'information_schema', 'crdb_internal', 'pg_extension')
                        AND c.table_name NOT LIKE '\\_molt\\_%'
                        {}
                    ORDER BY c.table_schema, c.table_name, c.ordinal_position",
                    hidden
                ),
                "SELECT kcu.table_schema::TEXT, kcu.table_name::TEXT, kcu.column_name::TEXT
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                    AND tc.table_name = kcu.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                ORDER BY kcu.table_schema, kcu.table_name, kcu.ordinal_position"
                    .to_string(),
            )
        }
    }
}

fn text_at(row: &[Datum], idx: usize) -> String {
    match row.get(idx) {
        Some(Datum::Text(s)) => s.clone(),
        Some(Datum::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Result of comparing the source catalog against the target catalog.
#[derive(Debug, Default)]
pub struct TableDiff {
    pub verified: Vec<VerifiedTable>,
    pub missing: Vec<TableName>,
    pub extraneous: Vec<TableName>,
    /// Tables present on both sides whose definitions disagree, with the reason.
    /// A table listed here may still be in `verified` when only non-key
    /// columns differ.
    pub mismatching: Vec<(TableName, String)>,
}

/// Match source tables to target tables by case-insensitive name.
///
/// Tables need a primary key on both sides with the same columns and
/// comparable types. Non-key columns present on only one side are reported
/// and left out of the verified column list.
pub fn diff_tables(source: &[Table], target: &[Table]) -> TableDiff {
    let key = |n: &TableName| (n.schema.to_lowercase(), n.table.to_lowercase());
    let mut target_by_name: BTreeMap<(String, String), &Table> =
        target.iter().map(|t| (key(&t.name), t)).collect();

    let mut diff = TableDiff::default();
    for src in source {
        let Some(dst) = target_by_name.remove(&key(&src.name)) else {
            diff.missing.push(src.name.clone());
            continue;
        };

        match verify_pair(src, dst) {
            Ok((table, column_notes)) => {
                for note in column_notes {
                    diff.mismatching.push((src.name.clone(), note));
                }
                diff.verified.push(table);
            }
            Err(reason) => diff.mismatching.push((src.name.clone(), reason)),
        }
    }
    diff.extraneous = target_by_name.into_values().map(|t| t.name.clone()).collect();
    diff
}

fn verify_pair(src: &Table, dst: &Table) -> std::result::Result<(VerifiedTable, Vec<String>), String> {
    if src.pk_columns.is_empty() {
        return Err("missing a primary key on the source".to_string());
    }
    if dst.pk_columns.is_empty() {
        return Err("missing a primary key on the target".to_string());
    }
    let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
    if lower(&src.pk_columns) != lower(&dst.pk_columns) {
        return Err(format!(
            "primary key columns differ: source ({}) vs target ({})",
            src.pk_columns.join(", "),
            dst.pk_columns.join(", ")
        ));
    }

    let find = |t: &Table, name: &str| {
        t.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
    };

    let mut table = VerifiedTable {
        name: dst.name.clone(),
        columns: Vec::new(),
        pk_columns: dst.pk_columns.clone(),
        source_types: Vec::new(),
        target_types: Vec::new(),
    };
    let mut notes = Vec::new();

    for pk in &dst.pk_columns {
        let (Some(s), Some(t)) = (find(src, pk), find(dst, pk)) else {
            return Err(format!("primary key column {} not found", pk));
        };
        if !families_comparable(type_family(&s.type_name), type_family(&t.type_name)) {
            return Err(format!(
                "primary key column {} has incomparable types: {} vs {}",
                pk, s.type_name, t.type_name
            ));
        }
        table.columns.push(t.name.clone());
        table.source_types.push(s.type_name);
        table.target_types.push(t.type_name);
    }

    for t in &dst.columns {
        if table.columns.iter().any(|c| c.eq_ignore_ascii_case(&t.name)) {
            continue;
        }
        match find(src, &t.name) {
            Some(s) => {
                table.columns.push(t.name.clone());
                table.source_types.push(s.type_name);
                table.target_types.push(t.type_name.clone());
            }
            None => notes.push(format!("extraneous column {} found on target", t.name)),
        }
    }
    for s in &src.columns {
        if find(dst, &s.name).is_none() {
            notes.push(format!("missing column {} on target", s.name));
        }
    }

    Ok((table, notes))
}

/// Coarse type families, used to decide comparability and select casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Bool,
    Int,
    Float,
    Decimal,
    String,
    Bytes,
    Uuid,
    Timestamp,
    Date,
    Time,
    Json,
    Other,
}

pub fn type_family(type_name: &str) -> TypeFamily {
    let t = type_name.to_lowercase();
    let t = t.split('(').next().unwrap_or("").trim();
    match t {
        "bool" | "boolean" => TypeFamily::Bool,
        "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "int64"
        | "tinyint" | "mediumint" | "serial" | "bigserial" | "smallserial" => TypeFamily::Int,
        "real" | "double precision" | "float" | "float4" | "float8" | "double" => {
            TypeFamily::Float
        }
        "numeric" | "decimal" => TypeFamily::Decimal,
        "text" | "character varying" | "varchar" | "character" | "char" | "string"
        | "tinytext" | "mediumtext" | "longtext" | "enum" | "set" | "name" => TypeFamily::String,
        "bytea" | "bytes" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary"
        | "varbinary" => TypeFamily::Bytes,
        "uuid" => TypeFamily::Uuid,
        "timestamp without time zone" | "timestamp with time zone" | "timestamp"
        | "timestamptz" | "datetime" => TypeFamily::Timestamp,
        "date" => TypeFamily::Date,
        "time without time zone" | "time" => TypeFamily::Time,
        "json" | "jsonb" => TypeFamily::Json,
        _ => TypeFamily::Other,
    }
}

fn families_comparable(a: TypeFamily, b: TypeFamily) -> bool {
    use TypeFamily::*;
    let numeric = |f| matches!(f, Int | Float | Decimal);
    a == b
        || matches!((a, b), (Bool, Int) | (Int, Bool) | (Uuid, String) | (String, Uuid))
        || (numeric(a) && numeric(b))
}

/// Select expression for a column so that the decoder sees a type it handles.
pub fn select_expr(dialect: Dialect, column: &str, type_name: &str) -> String {
    let quoted = dialect.quote_ident(column);
    let t = type_name.to_lowercase();
    match dialect {
        Dialect::MySql => match t.as_str() {
            "bit" => format!("CAST({} AS UNSIGNED)", quoted),
            _ if type_family(&t) == TypeFamily::Other => format!("CAST({} AS CHAR)", quoted),
            _ => quoted,
        },
        Dialect::Postgres | Dialect::CockroachDb => {
            if type_family(&t) == TypeFamily::Other || t == "time with time zone" {
                format!("{}::TEXT", quoted)
            } else {
                quoted
            }
        }
    }
}

/// Schema and table regex filters, anchored at both ends.
#[derive(Debug, Clone)]
pub struct NameFilter {
    schema: Regex,
    table: Regex,
}

impl NameFilter {
    pub fn new(schema_filter: &str, table_filter: &str) -> Result<Self> {
        let anchored = |p: &str| Regex::new(&format!("^(?:{})$", p));
        Ok(Self {
            schema: anchored(schema_filter)
                .with_context(|| format!("Invalid schema filter: {}", schema_filter))?,
            table: anchored(table_filter)
                .with_context(|| format!("Invalid table filter: {}", table_filter))?,
        })
    }

    pub fn matches(&self, name: &TableName) -> bool {
        self.schema.is_match(&name.schema) && self.table.is_match(&name.table)
    }
}
