// ABOUTME: Row event listeners fed by the row verifier
// ABOUTME: The default one counts and reports; the live one defers suspects to the reverifier

use super::inconsistency::{
    ExtraneousRow, MismatchingColumn, MismatchingRow, MissingRow, ReportableObject, RowStats,
};
use super::reporter::Reporter;
use crate::config::LiveReverifySettings;
use crate::datum::Datum;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Truth rows scanned between progress reports.
pub const PROGRESS_EVERY: u64 = 10_000;

#[async_trait]
pub trait RowEventListener: Send {
    async fn on_extraneous(&mut self, row: ExtraneousRow);
    async fn on_missing(&mut self, row: MissingRow);
    async fn on_mismatch(&mut self, row: MismatchingRow);
    /// `report_log` is false once the shard has already reported these columns.
    async fn on_column_mismatch(&mut self, row: MismatchingColumn, report_log: bool);
    async fn on_match(&mut self);
    async fn on_row_scan(&mut self);
}

/// Counts outcomes into `RowStats` and forwards findings to a reporter.
pub struct DefaultListener {
    reporter: Arc<dyn Reporter>,
    stats: RowStats,
    label: String,
    progress: bool,
}

impl DefaultListener {
    pub fn new(reporter: Arc<dyn Reporter>, stats: RowStats, label: String) -> Self {
        Self {
            reporter,
            stats,
            label,
            progress: true,
        }
    }

    /// Skip the periodic progress reports.
    pub fn without_progress(mut self) -> Self {
        self.progress = false;
        self
    }

    pub fn stats(&self) -> &RowStats {
        &self.stats
    }

    pub fn into_stats(self) -> RowStats {
        self.stats
    }
}

#[async_trait]
impl RowEventListener for DefaultListener {
    async fn on_extraneous(&mut self, row: ExtraneousRow) {
        self.stats.num_extraneous += 1;
        self.reporter
            .report(&ReportableObject::ExtraneousRow(row))
            .await;
    }

    async fn on_missing(&mut self, row: MissingRow) {
        self.stats.num_missing += 1;
        self.reporter.report(&ReportableObject::MissingRow(row)).await;
    }

    async fn on_mismatch(&mut self, row: MismatchingRow) {
        self.stats.num_mismatch += 1;
        self.reporter
            .report(&ReportableObject::MismatchingRow(row))
            .await;
    }

    async fn on_column_mismatch(&mut self, row: MismatchingColumn, report_log: bool) {
        if report_log {
            self.stats.num_column_mismatch += row.mismatching_columns.len() as u64;
            self.reporter
                .report(&ReportableObject::MismatchingColumn(row))
                .await;
        }
        self.stats.num_conditional_success += 1;
    }

    async fn on_match(&mut self) {
        self.stats.num_success += 1;
    }

    async fn on_row_scan(&mut self) {
        if self.progress && self.stats.num_verified > 0 && self.stats.num_verified % PROGRESS_EVERY == 0 {
            self.reporter
                .report(&ReportableObject::SummaryReport {
                    info: format!("progress on {}", self.label),
                    stats: self.stats.clone(),
                })
                .await;
        }
        self.stats.num_verified += 1;
    }
}

/// Queues the keys of suspect rows for the live reverifier instead of reporting them.
pub struct LiveListener {
    base: DefaultListener,
    pks: Vec<Vec<Datum>>,
    tx: mpsc::Sender<Vec<Vec<Datum>>>,
    settings: LiveReverifySettings,
    last_flush: Instant,
}

impl LiveListener {
    pub fn new(
        base: DefaultListener,
        tx: mpsc::Sender<Vec<Vec<Datum>>>,
        settings: LiveReverifySettings,
    ) -> Self {
        Self {
            base,
            pks: Vec::new(),
            tx,
            settings,
            last_flush: Instant::now(),
        }
    }

    fn defer(&mut self, pk: Vec<Datum>) {
        self.pks.push(pk);
        self.base.stats.num_live_retry += 1;
    }

    /// Hand queued keys to the reverifier.
    pub async fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.pks.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pks);
        tracing::trace!("flushing {} keys to the live reverifier", batch.len());
        if self.tx.send(batch).await.is_err() {
            tracing::warn!("live reverifier stopped before the scan finished");
        }
    }

    /// Flush and release the channel so the reverifier can drain.
    pub async fn finish(mut self) -> DefaultListener {
        self.flush().await;
        self.base
    }
}

#[async_trait]
impl RowEventListener for LiveListener {
    async fn on_extraneous(&mut self, row: ExtraneousRow) {
        self.defer(row.pk_values);
    }

    async fn on_missing(&mut self, row: MissingRow) {
        self.defer(row.pk_values);
    }

    async fn on_mismatch(&mut self, row: MismatchingRow) {
        self.defer(row.pk_values);
    }

    async fn on_column_mismatch(&mut self, row: MismatchingColumn, report_log: bool) {
        self.base.on_column_mismatch(row, report_log).await;
    }

    async fn on_match(&mut self) {
        self.base.on_match().await;
    }

    async fn on_row_scan(&mut self) {
        self.base.on_row_scan().await;
        if self.last_flush.elapsed() > self.settings.flush_interval
            || self.pks.len() >= self.settings.max_batch_size
        {
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbtable::TableName;
    use crate::verify::reporter::testutil::CollectingReporter;
    use std::time::Duration;

    fn missing(id: i64) -> MissingRow {
        MissingRow {
            name: TableName::new("public", "users"),
            pk_columns: vec!["id".into()],
            pk_values: vec![Datum::Int(id)],
            columns: vec!["id".into()],
            values: vec![Datum::Int(id)],
        }
    }

    fn column_mismatch() -> MismatchingColumn {
        MismatchingColumn {
            name: TableName::new("public", "users"),
            pk_columns: vec!["id".into()],
            pk_values: vec![Datum::Int(1)],
            mismatching_columns: vec!["a".into(), "b".into()],
            truth_vals: vec![Datum::Int(1), Datum::Int(2)],
            target_vals: vec![Datum::Bytes(vec![1]), Datum::Bytes(vec![2])],
            info: vec!["a (x)".into(), "b (y)".into()],
        }
    }

    #[tokio::test]
    async fn test_default_listener_counts_and_reports() {
        let reporter = Arc::new(CollectingReporter::default());
        let mut evl = DefaultListener::new(reporter.clone(), RowStats::default(), "t".into());

        evl.on_row_scan().await;
        evl.on_match().await;
        evl.on_row_scan().await;
        evl.on_missing(missing(2)).await;
        evl.on_row_scan().await;
        evl.on_column_mismatch(column_mismatch(), true).await;
        evl.on_row_scan().await;
        evl.on_column_mismatch(column_mismatch(), false).await;

        let stats = evl.into_stats();
        assert_eq!(stats.num_verified, 4);
        assert_eq!(stats.num_success, 1);
        assert_eq!(stats.num_missing, 1);
        assert_eq!(stats.num_conditional_success, 2);
        assert_eq!(stats.num_column_mismatch, 2);
        // Only the first column mismatch is reported.
        assert_eq!(reporter.taken().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_report_every_interval() {
        let reporter = Arc::new(CollectingReporter::default());
        let mut evl = DefaultListener::new(reporter.clone(), RowStats::default(), "public.users".into());
        for _ in 0..(PROGRESS_EVERY * 2 + 1) {
            evl.on_row_scan().await;
        }
        let reports = reporter.taken();
        assert_eq!(reports.len(), 2);
        match &reports[0] {
            ReportableObject::SummaryReport { info, stats } => {
                assert_eq!(info, "progress on public.users");
                assert_eq!(stats.num_verified, PROGRESS_EVERY);
            }
            other => panic!("unexpected report {:?}", other),
        }

        let quiet = Arc::new(CollectingReporter::default());
        let mut evl = DefaultListener::new(quiet.clone(), RowStats::default(), "t".into()).without_progress();
        for _ in 0..(PROGRESS_EVERY + 1) {
            evl.on_row_scan().await;
        }
        assert!(quiet.taken().is_empty());
    }

    #[tokio::test]
    async fn test_live_listener_defers_and_flushes_on_batch_size() {
        let reporter = Arc::new(CollectingReporter::default());
        let base = DefaultListener::new(reporter.clone(), RowStats::default(), "t".into());
        let (tx, mut rx) = mpsc::channel(8);
        let settings = LiveReverifySettings {
            max_batch_size: 2,
            flush_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut evl = LiveListener::new(base, tx, settings);

        for id in 1..=3 {
            evl.on_row_scan().await;
            evl.on_missing(missing(id)).await;
        }
        // The third scan noticed the full batch; the third key is still queued.
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![vec![Datum::Int(1)], vec![Datum::Int(2)]]);

        let base = evl.finish().await;
        assert_eq!(rx.recv().await.unwrap(), vec![vec![Datum::Int(3)]]);
        assert!(rx.recv().await.is_none());
        assert_eq!(base.stats().num_live_retry, 3);
        assert_eq!(base.stats().num_missing, 0);
        assert!(reporter.inconsistencies().is_empty());
    }
}
