// ABOUTME: SQL builders for keyset-paginated shard scans and key lookups
// ABOUTME: Selects primary-key columns first so rows carry their key as a prefix

use crate::datum::Datum;
use crate::dbconn::Dialect;
use crate::dbtable::catalog::select_expr;
use crate::dbtable::{TableShard, VerifiedTable};

/// The SELECT list for a table, with casts for types the decoders lack.
pub fn select_list(dialect: Dialect, table: &VerifiedTable, types: &[String]) -> String {
    table
        .columns
        .iter()
        .zip(types.iter())
        .map(|(col, ty)| select_expr(dialect, col, ty))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Next page of a shard scan, strictly after `after` when given.
pub fn scan_query(
    dialect: Dialect,
    shard: &TableShard,
    types: &[String],
    after: Option<&[Datum]>,
    limit: usize,
) -> String {
    let table = &shard.table;
    let pk = table.quoted_pk_columns(dialect);

    let mut conds = shard_conditions(dialect, shard);
    if let Some(after) = after {
        conds.push(tuple_condition(dialect, &pk, ">", after));
    }

    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
        select_list(dialect, table, types),
        table.name.qualified(dialect),
        where_clause(&conds),
        pk.join(", "),
        limit
    )
}

/// Every row of a shard, unordered. Used to feed native export.
pub fn export_query(dialect: Dialect, shard: &TableShard, types: &[String]) -> String {
    let conds = shard_conditions(dialect, shard);
    format!(
        "SELECT {} FROM {}{}",
        select_list(dialect, &shard.table, types),
        shard.table.name.qualified(dialect),
        where_clause(&conds)
    )
}

/// Rows matching any of the given primary keys, in key order.
pub fn lookup_query(
    dialect: Dialect,
    table: &VerifiedTable,
    types: &[String],
    pks: &[Vec<Datum>],
) -> String {
    let pk = table.quoted_pk_columns(dialect);
    let keys = pks
        .iter()
        .map(|key| format!("({})", literals(dialect, key).join(", ")))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT {} FROM {} WHERE ({}) IN ({}) ORDER BY {}",
        select_list(dialect, table, types),
        table.name.qualified(dialect),
        pk.join(", "),
        keys,
        pk.join(", ")
    )
}

fn shard_conditions(dialect: Dialect, shard: &TableShard) -> Vec<String> {
    let pk = shard.table.quoted_pk_columns(dialect);
    let mut conds = Vec::new();
    if !shard.start_pk.is_empty() {
        conds.push(tuple_condition(dialect, &pk, ">=", &shard.start_pk));
    }
    if !shard.end_pk.is_empty() {
        conds.push(tuple_condition(dialect, &pk, "<", &shard.end_pk));
    }
    conds
}

/// `(a, b) op (x, y)` over the first `values.len()` key columns.
fn tuple_condition(dialect: Dialect, pk: &[String], op: &str, values: &[Datum]) -> String {
    let n = values.len().min(pk.len());
    format!(
        "({}) {} ({})",
        pk[..n].join(", "),
        op,
        literals(dialect, &values[..n]).join(", ")
    )
}

fn literals(dialect: Dialect, values: &[Datum]) -> Vec<String> {
    values.iter().map(|v| v.to_sql_literal(dialect)).collect()
}

fn where_clause(conds: &[String]) -> String {
    if conds.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conds.join(" AND "))
    }
}
