// ABOUTME: Reporters that consume verification findings
// ABOUTME: Logging, fan-out, and a fixer that rewrites the target to match the truth

use super::inconsistency::{reportable_values, ReportableObject, RowStats};
use crate::datum::Datum;
use crate::dbconn::{Conn, Dialect};
use crate::dbtable::TableName;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, obj: &ReportableObject);

    /// Flush anything pending. Errors surface failures the reporter swallowed.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sends every object to each inner reporter in order.
pub struct CombinedReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl CombinedReporter {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

#[async_trait]
impl Reporter for CombinedReporter {
    async fn report(&self, obj: &ReportableObject) {
        for r in &self.reporters {
            r.report(obj).await;
        }
    }

    async fn close(&self) -> Result<()> {
        let mut first_err = None;
        for r in &self.reporters {
            if let Err(e) = r.close().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Writes findings to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, obj: &ReportableObject) {
        match obj {
            ReportableObject::MissingTable(name) => {
                tracing::warn!(
                    table_schema = %name.schema,
                    table_name = %name.table,
                    "missing table detected"
                );
            }
            ReportableObject::ExtraneousTable(name) => {
                tracing::warn!(
                    table_schema = %name.schema,
                    table_name = %name.table,
                    "extraneous table detected"
                );
            }
            ReportableObject::MismatchingTableDefinition { name, info } => {
                tracing::warn!(
                    table_schema = %name.schema,
                    table_name = %name.table,
                    mismatch_info = %info,
                    "mismatching table definition"
                );
            }
            ReportableObject::StatusReport { info } => {
                tracing::info!("{}", info);
            }
            ReportableObject::SummaryReport { info, stats } => {
                log_summary(info, stats);
            }
            ReportableObject::MismatchingRow(row) => {
                tracing::warn!(
                    table_schema = %row.name.schema,
                    table_name = %row.name.table,
                    source_values = %column_values(&row.mismatching_columns, &row.truth_vals),
                    target_values = %column_values(&row.mismatching_columns, &row.target_vals),
                    primary_key = ?reportable_values(&row.pk_values),
                    "mismatching row value"
                );
            }
            ReportableObject::MismatchingColumn(row) => {
                tracing::warn!(
                    table_schema = %row.name.schema,
                    table_name = %row.name.table,
                    source_values = %column_values(&row.mismatching_columns, &row.truth_vals),
                    target_values = %column_values(&row.mismatching_columns, &row.target_vals),
                    primary_key = ?reportable_values(&row.pk_values),
                    "mismatching column(s) found - {}",
                    row.info.join(";")
                );
            }
            ReportableObject::MissingRow(row) => {
                tracing::warn!(
                    table_schema = %row.name.schema,
                    table_name = %row.name.table,
                    primary_key = ?reportable_values(&row.pk_values),
                    "missing row"
                );
            }
            ReportableObject::ExtraneousRow(row) => {
                tracing::warn!(
                    table_schema = %row.name.schema,
                    table_name = %row.name.table,
                    primary_key = ?reportable_values(&row.pk_values),
                    "extraneous row"
                );
            }
        }
    }
}

fn log_summary(info: &str, stats: &RowStats) {
    let mut msg = info.to_string();
    if stats.num_conditional_success > 0 {
        msg.push_str(
            " - please check all warnings and errors for column mismatches to determine success",
        );
    }
    tracing::info!(
        table_schema = %stats.schema,
        table_name = %stats.table,
        num_truth_rows = stats.num_verified,
        num_success = stats.num_success,
        num_conditional_success = stats.num_conditional_success,
        num_missing = stats.num_missing,
        num_mismatch = stats.num_mismatch,
        num_extraneous = stats.num_extraneous,
        num_live_retry = stats.num_live_retry,
        num_column_mismatch = stats.num_column_mismatch,
        "{}",
        msg
    );
}

/// `{col: value, ...}` for log fields.
fn column_values(columns: &[String], values: &[Datum]) -> String {
    let pairs = columns
        .iter()
        .zip(values.iter())
        .map(|(c, v)| format!("{}: {}", c, v))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", pairs)
}

/// Repairs the target so it matches the truth.
///
/// Failed statements are logged and counted; `close` reports them.
pub struct FixReporter {
    target: Arc<dyn Conn>,
    failures: AtomicUsize,
}

impl FixReporter {
    pub fn new(target: Arc<dyn Conn>) -> Self {
        Self {
            target,
            failures: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Reporter for FixReporter {
    async fn report(&self, obj: &ReportableObject) {
        let Some((action, name, pk, sql)) = fix_statement(self.target.dialect(), obj) else {
            return;
        };
        tracing::info!(
            table_schema = %name.schema,
            table_name = %name.table,
            primary_key = ?reportable_values(pk),
            "{}",
            action
        );
        if let Err(e) = self.target.execute(&sql).await {
            self.failures.fetch_add(1, Ordering::SeqCst);
            tracing::error!(
                table_schema = %name.schema,
                table_name = %name.table,
                "failed {}: {:#}",
                action,
                e
            );
        }
    }

    async fn close(&self) -> Result<()> {
        let failed = self.failures.load(Ordering::SeqCst);
        if failed > 0 {
            bail!("{} row fix(es) failed on the target", failed);
        }
        Ok(())
    }
}

/// Statement that repairs one row finding, with a log action and the row's key.
pub fn fix_statement(
    dialect: Dialect,
    obj: &ReportableObject,
) -> Option<(&'static str, &TableName, &[Datum], String)> {
    match obj {
        ReportableObject::MissingRow(row) => Some((
            "adding missing row",
            &row.name,
            &row.pk_values,
            upsert_sql(dialect, &row.name, &row.pk_columns, &row.columns, &row.values),
        )),
        ReportableObject::MismatchingRow(row) => {
            let mut columns = row.pk_columns.clone();
            columns.extend(row.mismatching_columns.iter().cloned());
            let mut values = row.pk_values.clone();
            values.extend(row.truth_vals.iter().cloned());
            Some((
                "fixing mismatching row",
                &row.name,
                &row.pk_values,
                upsert_sql(dialect, &row.name, &row.pk_columns, &columns, &values),
            ))
        }
        ReportableObject::ExtraneousRow(row) => Some((
            "deleting extraneous row",
            &row.name,
            &row.pk_values,
            format!(
                "DELETE FROM {} WHERE {}",
                row.name.qualified(dialect),
                pk_predicate(dialect, &row.pk_columns, &row.pk_values)
            ),
        )),
        _ => None,
    }
}

fn upsert_sql(
    dialect: Dialect,
    name: &TableName,
    pk_columns: &[String],
    columns: &[String],
    values: &[Datum],
) -> String {
    let cols = columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let vals = values
        .iter()
        .map(|v| v.to_sql_literal(dialect))
        .collect::<Vec<_>>()
        .join(", ");
    let non_pk: Vec<String> = columns
        .iter()
        .filter(|c| !pk_columns.contains(c))
        .map(|c| dialect.quote_ident(c))
        .collect();

    match dialect {
        Dialect::CockroachDb => format!(
            "UPSERT INTO {} ({}) VALUES ({})",
            name.qualified(dialect),
            cols,
            vals
        ),
        Dialect::Postgres => {
            let pk = pk_columns
                .iter()
                .map(|c| dialect.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let action = if non_pk.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!(
                    "DO UPDATE SET {}",
                    non_pk
                        .iter()
                        .map(|c| format!("{} = excluded.{}", c, c))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
                name.qualified(dialect),
                cols,
                vals,
                pk,
                action
            )
        }
        Dialect::MySql => format!(
            "REPLACE INTO {} ({}) VALUES ({})",
            name.qualified(dialect),
            cols,
            vals
        ),
    }
}

fn pk_predicate(dialect: Dialect, pk_columns: &[String], pk_values: &[Datum]) -> String {
    pk_columns
        .iter()
        .zip(pk_values.iter())
        .map(|(c, v)| format!("{} = {}", dialect.quote_ident(c), v.to_sql_literal(dialect)))
        .collect::<Vec<_>>()
        .join(" AND ")
}
