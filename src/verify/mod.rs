// ABOUTME: Verify driver - compares every table row by row between source and target
// ABOUTME: Diffs catalogs, splits tables into shards and verifies shards concurrently

pub mod inconsistency;
pub mod listener;
pub mod live;
pub mod reporter;
pub mod rowverify;

use crate::config::{LiveReverifySettings, VerifyConfig};
use crate::dbconn::Conn;
use crate::dbtable::catalog::{diff_tables, load_tables, NameFilter};
use crate::dbtable::split::split_table;
use crate::dbtable::{Side, TableShard};
use crate::metrics::Metrics;
use crate::rowiterator::RowIterator;
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use inconsistency::{ReportableObject, RowStats};
use listener::{DefaultListener, LiveListener};
use reporter::Reporter;
use rowverify::verify_rows;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a verify run.
#[derive(Debug, Clone, Default)]
pub struct VerifySummary {
    /// Per table, summed over its shards.
    pub tables: BTreeMap<String, RowStats>,
    pub missing_tables: usize,
    pub extraneous_tables: usize,
    pub mismatching_tables: usize,
    pub duration: Duration,
}

impl VerifySummary {
    pub fn totals(&self) -> RowStats {
        let mut total = RowStats::default();
        for stats in self.tables.values() {
            total.add(stats);
        }
        total
    }

    /// No table-level or row-level inconsistency was found.
    pub fn is_consistent(&self) -> bool {
        self.missing_tables == 0
            && self.extraneous_tables == 0
            && self.mismatching_tables == 0
            && !self.totals().has_inconsistencies()
    }
}

/// Verify every table both sides agree on.
///
/// Findings go to `reporter`. A shard failing to read is an error; rows that
/// differ are not, so callers decide what an inconsistent summary means.
pub async fn verify(
    cfg: &VerifyConfig,
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    reporter: Arc<dyn Reporter>,
    metrics: Metrics,
) -> Result<VerifySummary> {
    cfg.validate()?;
    let start = Instant::now();
    reporter
        .report(&ReportableObject::StatusReport {
            info: "verification in progress".into(),
        })
        .await;

    let filter = NameFilter::new(&cfg.filter.schema, &cfg.filter.table)?;
    let source_tables = load_tables(source.as_ref())
        .await
        .context("Failed to list tables from source database")?;
    let target_tables = load_tables(target.as_ref())
        .await
        .context("Failed to list tables from target database")?;
    let diff = diff_tables(&source_tables, &target_tables);

    let mut summary = VerifySummary::default();
    for name in diff.missing.iter().filter(|n| filter.matches(n)) {
        summary.missing_tables += 1;
        reporter
            .report(&ReportableObject::MissingTable(name.clone()))
            .await;
    }
    for name in diff.extraneous.iter().filter(|n| filter.matches(n)) {
        summary.extraneous_tables += 1;
        reporter
            .report(&ReportableObject::ExtraneousTable(name.clone()))
            .await;
    }
    for (name, info) in diff.mismatching.iter().filter(|(n, _)| filter.matches(n)) {
        summary.mismatching_tables += 1;
        reporter
            .report(&ReportableObject::MismatchingTableDefinition {
                name: name.clone(),
                info: info.clone(),
            })
            .await;
    }

    let mut shards: Vec<TableShard> = Vec::new();
    for table in diff.verified.into_iter().filter(|t| filter.matches(&t.name)) {
        let name = table.name.clone();
        summary.tables.insert(name.safe_string(), RowStats::for_table(&name));
        let table_shards = split_table(source.as_ref(), &table, cfg.table_splits)
            .await
            .with_context(|| format!("Failed to split {} into shards", name))?;
        shards.extend(table_shards);
    }

    if shards.is_empty() {
        tracing::warn!("⚠ No tables found to verify");
    } else {
        reporter
            .report(&ReportableObject::StatusReport {
                info: format!(
                    "starting verify on {} table(s) in {} shard(s) (concurrency: {})",
                    summary.tables.len(),
                    shards.len(),
                    cfg.concurrency
                ),
            })
            .await;
    }

    let progress = ProgressBar::new(shards.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );

    let results: Vec<(TableShard, Result<RowStats>)> = stream::iter(shards)
        .map(|shard| {
            let source = source.clone();
            let target = target.clone();
            let reporter = reporter.clone();
            let live = cfg.live.clone();
            let rows_per_batch = cfg.rows_per_batch;
            let pb = progress.clone();

            async move {
                let result = async {
                    let source = source
                        .clone_conn()
                        .await
                        .context("Failed to create additional source connection")?;
                    let target = target
                        .clone_conn()
                        .await
                        .context("Failed to create additional target connection")?;
                    verify_shard(source, target, shard.clone(), rows_per_batch, reporter, live.as_ref())
                        .await
                }
                .await;
                pb.inc(1);
                pb.set_message(format!("Verified {}", shard_label(&shard)));
                (shard, result)
            }
        })
        .buffer_unordered(cfg.concurrency)
        .collect()
        .await;

    progress.finish_with_message("Verification complete");

    let mut failed = Vec::new();
    for (shard, result) in results {
        match result {
            Ok(stats) => {
                let key = shard.table.name.safe_string();
                metrics.verify_stats(&key, &stats);
                summary.tables.entry(key).or_default().add(&stats);
            }
            Err(e) => {
                tracing::error!("  ✗ ERROR: {}: {:#}", shard_label(&shard), e);
                failed.push(shard_label(&shard));
            }
        }
    }
    summary.duration = start.elapsed();

    if let Err(e) = reporter.close().await {
        tracing::error!("error closing reporter: {:#}", e);
    }

    log_summary(&summary);

    if !failed.is_empty() {
        bail!(
            "verification failed on {} shard(s): {}",
            failed.len(),
            failed.join(", ")
        );
    }
    Ok(summary)
}

fn log_summary(summary: &VerifySummary) {
    let totals = summary.totals();
    tracing::info!("");
    tracing::info!("========================================");
    tracing::info!("Verification Summary");
    tracing::info!("========================================");
    tracing::info!("Tables verified: {}", summary.tables.len());
    tracing::info!("Missing tables: {}", summary.missing_tables);
    tracing::info!("Extraneous tables: {}", summary.extraneous_tables);
    tracing::info!("Mismatching table definitions: {}", summary.mismatching_tables);
    tracing::info!("Rows: {}", totals);
    for (name, stats) in &summary.tables {
        if stats.has_inconsistencies() {
            tracing::warn!("  ✗ {}: {}", name, stats);
        } else {
            tracing::info!("  ✓ {}: {}", name, stats);
        }
    }
    tracing::info!("Duration: {:?}", summary.duration);
    tracing::info!("========================================");
    tracing::info!("");
}

fn shard_label(shard: &TableShard) -> String {
    format!(
        "{} (shard {}/{})",
        shard.table.name, shard.shard_num, shard.total_shards
    )
}

/// Verify one shard. With live settings, suspect rows are rechecked before
/// they count.
pub async fn verify_shard(
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    shard: TableShard,
    rows_per_batch: usize,
    reporter: Arc<dyn Reporter>,
    live: Option<&LiveReverifySettings>,
) -> Result<RowStats> {
    let label = shard_label(&shard);
    let table = shard.table.clone();
    let mut truth = RowIterator::new(source.clone(), shard.clone(), Side::Source, rows_per_batch);
    let mut other = RowIterator::new(target.clone(), shard, Side::Target, rows_per_batch);
    let base = DefaultListener::new(reporter.clone(), RowStats::for_table(&table.name), label.clone());

    let (stats, info) = match live {
        None => {
            let mut evl = base;
            verify_rows(&mut truth, &mut other, &table, &mut evl)
                .await
                .with_context(|| format!("Failed to verify {}", label))?;
            (evl.into_stats(), format!("finished row verification on {}", label))
        }
        Some(settings) => {
            let (tx, handle) = live::spawn(
                settings.clone(),
                source,
                target,
                table.clone(),
                reporter.clone(),
                label.clone(),
            );
            let mut evl = LiveListener::new(base, tx, settings.clone());
            let scanned = verify_rows(&mut truth, &mut other, &table, &mut evl).await;
            if let Err(e) = scanned {
                handle.abort();
                return Err(e.context(format!("Failed to verify {}", label)));
            }

            tracing::trace!("waiting for live reverifier on {}", label);
            let base = evl.finish().await;
            let late = handle
                .await
                .context("live reverifier task failed")?
                .with_context(|| format!("Failed to reverify {}", label))?;
            let mut stats = base.into_stats();
            stats.absorb_outcomes(&late);
            (stats, format!("finished LIVE row verification on {}", label))
        }
    };

    reporter
        .report(&ReportableObject::SummaryReport {
            info,
            stats: stats.clone(),
        })
        .await;
    Ok(stats)
}
