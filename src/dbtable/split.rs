// ABOUTME: Splits a table into primary-key range shards for parallel scans
// ABOUTME: Divides integer and UUID key ranges evenly, otherwise returns one shard

use super::{TableShard, VerifiedTable};
use crate::datum::Datum;
use crate::dbconn::Conn;
use anyhow::{Context, Result};
use uuid::Uuid;

/// Split a table into at most `num_splits` shards on its first key column.
///
/// Bounds are sampled from `MIN`/`MAX` of the first primary-key column. The
/// first shard has no lower bound and the last no upper bound, so rows
/// outside the sampled range still belong to exactly one shard.
pub async fn split_table(
    conn: &dyn Conn,
    table: &VerifiedTable,
    num_splits: usize,
) -> Result<Vec<TableShard>> {
    if num_splits <= 1 {
        return Ok(vec![TableShard::whole(table.clone())]);
    }

    let dialect = conn.dialect();
    let pk = dialect.quote_ident(&table.pk_columns[0]);
    let sql = format!(
        "SELECT MIN({pk}), MAX({pk}) FROM {}",
        table.name.qualified(dialect)
    );
    let rows = conn
        .query(&sql)
        .await
        .with_context(|| format!("Failed to sample key range of {}", table.name))?;

    let (min, max) = match rows.first() {
        Some(row) if row.len() == 2 => (row[0].clone(), row[1].clone()),
        _ => return Ok(vec![TableShard::whole(table.clone())]),
    };

    let bounds = split_bounds(&min, &max, num_splits);
    tracing::debug!(table = %table.name, shards = bounds.len() + 1, "split table");
    Ok(shards_from_bounds(table, bounds))
}

/// Interior split points between `min` and `max`, in ascending order.
///
/// Returns no points when the key type is not divisible or the range is too
/// small to hold `n` distinct shards.
pub fn split_bounds(min: &Datum, max: &Datum, n: usize) -> Vec<Datum> {
    match (min, max) {
        (Datum::Int(lo), Datum::Int(hi)) => {
            let span = (*hi as i128) - (*lo as i128);
            if span < n as i128 {
                return Vec::new();
            }
            let step = span / n as i128;
            (1..n as i128)
                .map(|i| Datum::Int((*lo as i128 + step * i) as i64))
                .collect()
        }
        (Datum::Uuid(lo), Datum::Uuid(hi)) => {
            let (lo, hi) = (lo.as_u128(), hi.as_u128());
            if hi <= lo || hi - lo < n as u128 {
                return Vec::new();
            }
            let step = (hi - lo) / n as u128;
            (1..n as u128)
                .map(|i| Datum::Uuid(Uuid::from_u128(lo + step * i)))
                .collect()
        }
        _ => Vec::new(),
    }
}

fn shards_from_bounds(table: &VerifiedTable, bounds: Vec<Datum>) -> Vec<TableShard> {
    let total = bounds.len() + 1;
    let mut shards = Vec::with_capacity(total);
    let mut start: Vec<Datum> = Vec::new();
    for (i, bound) in bounds.into_iter().enumerate() {
        shards.push(TableShard {
            table: table.clone(),
            start_pk: start,
            end_pk: vec![bound.clone()],
            shard_num: i + 1,
            total_shards: total,
        });
        start = vec![bound];
    }
    shards.push(TableShard {
        table: table.clone(),
        start_pk: start,
        end_pk: Vec::new(),
        shard_num: total,
        total_shards: total,
    });
    shards
}
