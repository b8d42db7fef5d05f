// ABOUTME: Merge comparison of two key-ordered row streams
// ABOUTME: Classifies each key as match, mismatch, column mismatch, missing or extraneous

use super::inconsistency::{ExtraneousRow, MismatchingColumn, MismatchingRow, MissingRow};
use super::listener::RowEventListener;
use crate::datum::compare_rows;
use crate::dbconn::Row;
use crate::dbtable::VerifiedTable;
use crate::rowiterator::RowStream;
use anyhow::{anyhow, Context, Result};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Walk `truth` and `target` in key order, emitting one event per key.
///
/// Both streams must be sorted by primary key with the key columns first.
/// Incomparable columns are reported once per column for the whole call.
pub async fn verify_rows(
    truth: &mut dyn RowStream,
    target: &mut dyn RowStream,
    table: &VerifiedTable,
    evl: &mut dyn RowEventListener,
) -> Result<()> {
    let pk_len = table.pk_len();
    let mut seen_columns: HashSet<usize> = HashSet::new();

    'truth: while truth.has_next().await {
        evl.on_row_scan().await;
        let Some(truth_vals) = truth.next() else {
            break;
        };

        loop {
            if !target.has_next().await {
                if target.error().is_some() {
                    break 'truth;
                }
                evl.on_missing(missing_row(table, &truth_vals)).await;
                break;
            }

            let ord = match target.peek() {
                Some(target_vals) => {
                    compare_rows(&truth_vals[..pk_len], &target_vals[..pk_len])
                        .context("comparing primary keys")?
                }
                None => return Err(anyhow!("target stream reported a row but had none")),
            };

            match ord {
                Ordering::Greater => {
                    if let Some(target_vals) = target.next() {
                        evl.on_extraneous(extraneous_row(table, &target_vals)).await;
                    }
                }
                Ordering::Less => {
                    evl.on_missing(missing_row(table, &truth_vals)).await;
                    break;
                }
                Ordering::Equal => {
                    let target_vals = target
                        .next()
                        .ok_or_else(|| anyhow!("target stream lost its current row"))?;
                    compare_values(table, &truth_vals, &target_vals, &mut seen_columns, evl)
                        .await;
                    break;
                }
            }
        }
    }

    if let Some(e) = truth.error() {
        return Err(anyhow!("{:#}", e).context("reading truth rows"));
    }
    if let Some(e) = target.error() {
        return Err(anyhow!("{:#}", e).context("reading target rows"));
    }

    while target.has_next().await {
        if let Some(target_vals) = target.next() {
            evl.on_extraneous(extraneous_row(table, &target_vals)).await;
        }
    }
    if let Some(e) = target.error() {
        return Err(anyhow!("{:#}", e).context("reading target rows"));
    }
    Ok(())
}

async fn compare_values(
    table: &VerifiedTable,
    truth_vals: &Row,
    target_vals: &Row,
    seen_columns: &mut HashSet<usize>,
    evl: &mut dyn RowEventListener,
) {
    let pk_values = target_vals[..table.pk_len()].to_vec();
    let mut mismatch = MismatchingRow {
        name: table.name.clone(),
        pk_columns: table.pk_columns.clone(),
        pk_values: pk_values.clone(),
        mismatching_columns: Vec::new(),
        truth_vals: Vec::new(),
        target_vals: Vec::new(),
    };
    let mut incomparable = MismatchingColumn {
        name: table.name.clone(),
        pk_columns: table.pk_columns.clone(),
        pk_values,
        mismatching_columns: Vec::new(),
        truth_vals: Vec::new(),
        target_vals: Vec::new(),
        info: Vec::new(),
    };
    let mut report_log = true;

    for idx in table.pk_len()..target_vals.len().min(truth_vals.len()) {
        let column = &table.columns[idx];
        match truth_vals[idx].compare(&target_vals[idx]) {
            Ok(Ordering::Equal) => {}
            Ok(_) => {
                mismatch.mismatching_columns.push(column.clone());
                mismatch.truth_vals.push(truth_vals[idx].clone());
                mismatch.target_vals.push(target_vals[idx].clone());
            }
            Err(e) => {
                if !seen_columns.insert(idx) {
                    report_log = false;
                }
                incomparable.mismatching_columns.push(column.clone());
                incomparable.truth_vals.push(truth_vals[idx].clone());
                incomparable.target_vals.push(target_vals[idx].clone());
                incomparable.info.push(format!("{} ({})", column, e));
            }
        }
    }

    if !mismatch.mismatching_columns.is_empty() {
        evl.on_mismatch(mismatch).await;
    } else if !incomparable.mismatching_columns.is_empty() {
        evl.on_column_mismatch(incomparable, report_log).await;
    } else {
        evl.on_match().await;
    }
}

fn missing_row(table: &VerifiedTable, truth_vals: &Row) -> MissingRow {
    MissingRow {
        name: table.name.clone(),
        pk_columns: table.pk_columns.clone(),
        pk_values: table.pk_of(truth_vals).to_vec(),
        columns: table.columns.clone(),
        values: truth_vals.clone(),
    }
}

fn extraneous_row(table: &VerifiedTable, target_vals: &Row) -> ExtraneousRow {
    ExtraneousRow {
        name: table.name.clone(),
        pk_columns: table.pk_columns.clone(),
        pk_values: table.pk_of(target_vals).to_vec(),
    }
}
