// ABOUTME: Live reverifier that rechecks suspect rows while the target is still changing
// ABOUTME: Rereads flagged keys on both sides with backoff and reports only rows that never settle

use super::inconsistency::{
    ExtraneousRow, MismatchingColumn, MismatchingRow, MissingRow, ReportableObject, RowStats,
};
use super::listener::{DefaultListener, RowEventListener};
use super::reporter::Reporter;
use super::rowverify::verify_rows;
use crate::config::{LiveReverifySettings, RetrySettings};
use crate::datum::Datum;
use crate::dbconn::Conn;
use crate::dbtable::{Side, VerifiedTable};
use crate::rowiterator::{query::lookup_query, RowBuffer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Spaces operations at most `max_rps` per second. Unlimited without a rate.
pub struct RateLimiter {
    interval: Option<Interval>,
}

impl RateLimiter {
    pub fn new(max_rps: Option<u32>) -> Self {
        let interval = max_rps.filter(|rps| *rps > 0).map(|rps| {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / rps as f64));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    pub async fn wait(&mut self) {
        if let Some(interval) = &mut self.interval {
            interval.tick().await;
        }
    }
}

/// Delay before recheck number `attempt` (0-based).
pub fn backoff(retry: &RetrySettings, attempt: usize) -> Duration {
    let factor = retry
        .multiplier
        .saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
    retry
        .initial_backoff
        .saturating_mul(factor)
        .min(retry.max_backoff)
}

/// Start a reverifier for one shard.
///
/// Keys sent on the returned channel are rechecked until they settle or run
/// out of retries. Dropping the sender lets the task drain and return the
/// outcomes it counted.
pub fn spawn(
    settings: LiveReverifySettings,
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    table: VerifiedTable,
    reporter: Arc<dyn Reporter>,
    label: String,
) -> (mpsc::Sender<Vec<Vec<Datum>>>, JoinHandle<Result<RowStats>>) {
    let (tx, rx) = mpsc::channel(16);
    let listener =
        DefaultListener::new(reporter, RowStats::for_table(&table.name), label).without_progress();
    let reverifier = LiveReverifier {
        limiter: RateLimiter::new(settings.max_rps),
        settings,
        source,
        target,
        table,
        listener,
        reported_columns: HashSet::new(),
    };
    let handle = tokio::spawn(reverifier.run(rx));
    (tx, handle)
}

struct Pending {
    pks: Vec<Vec<Datum>>,
    attempt: usize,
    due: Instant,
}

struct LiveReverifier {
    settings: LiveReverifySettings,
    limiter: RateLimiter,
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    table: VerifiedTable,
    listener: DefaultListener,
    reported_columns: HashSet<String>,
}

impl LiveReverifier {
    async fn run(mut self, mut rx: mpsc::Receiver<Vec<Vec<Datum>>>) -> Result<RowStats> {
        let mut queue: Vec<Pending> = Vec::new();
        let mut open = true;

        loop {
            let next = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.due)
                .map(|(idx, p)| (idx, p.due));

            tokio::select! {
                msg = rx.recv(), if open => match msg {
                    Some(pks) if !pks.is_empty() => queue.push(Pending {
                        pks,
                        attempt: 0,
                        due: Instant::now() + backoff(&self.settings.retry, 0),
                    }),
                    Some(_) => {}
                    None => open = false,
                },
                _ = tokio::time::sleep_until(next.map(|(_, due)| due).unwrap_or_else(Instant::now)), if next.is_some() => {
                    if let Some((idx, _)) = next {
                        let item = queue.swap_remove(idx);
                        if let Some(retry) = self.recheck(item).await? {
                            queue.push(retry);
                        }
                    }
                }
                else => break,
            }
        }

        tracing::trace!("live reverifier for {} drained", self.table.name);
        Ok(self.listener.into_stats())
    }

    /// Reread one batch; returns what still needs another look.
    async fn recheck(&mut self, item: Pending) -> Result<Option<Pending>> {
        self.limiter.wait().await;

        let truth = self.lookup(Side::Source, &item.pks).await?;
        let target = self.lookup(Side::Target, &item.pks).await?;

        let mut collector = RetryCollector::default();
        verify_rows(
            &mut RowBuffer::new(truth),
            &mut RowBuffer::new(target),
            &self.table,
            &mut collector,
        )
        .await?;

        let column_mismatches = collector.column_mismatches.len();
        for row in collector.column_mismatches {
            let report_log = row
                .mismatching_columns
                .iter()
                .any(|c| self.reported_columns.insert(c.clone()));
            self.listener.on_column_mismatch(row, report_log).await;
        }

        // Keys that now match, or that vanished from both sides, have settled.
        let settled = item
            .pks
            .len()
            .saturating_sub(collector.failures.len() + column_mismatches);
        for _ in 0..settled {
            self.listener.on_match().await;
        }

        if collector.failures.is_empty() {
            return Ok(None);
        }

        let attempt = item.attempt + 1;
        if attempt >= self.settings.retry.max_retries {
            tracing::debug!(
                "{} row(s) of {} still inconsistent after {} recheck(s)",
                collector.failures.len(),
                self.table.name,
                attempt
            );
            for failure in collector.failures {
                match failure {
                    ReportableObject::MissingRow(row) => self.listener.on_missing(row).await,
                    ReportableObject::ExtraneousRow(row) => self.listener.on_extraneous(row).await,
                    ReportableObject::MismatchingRow(row) => self.listener.on_mismatch(row).await,
                    _ => {}
                }
            }
            return Ok(None);
        }

        let pks = collector
            .failures
            .iter()
            .filter_map(|f| match f {
                ReportableObject::MissingRow(row) => Some(row.pk_values.clone()),
                ReportableObject::ExtraneousRow(row) => Some(row.pk_values.clone()),
                ReportableObject::MismatchingRow(row) => Some(row.pk_values.clone()),
                _ => None,
            })
            .collect();
        Ok(Some(Pending {
            pks,
            attempt,
            due: Instant::now() + backoff(&self.settings.retry, attempt),
        }))
    }

    async fn lookup(&self, side: Side, pks: &[Vec<Datum>]) -> Result<Vec<Vec<Datum>>> {
        let conn = match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        };
        let sql = lookup_query(conn.dialect(), &self.table, self.table.types_for(side), pks);
        conn.query(&sql)
            .await
            .with_context(|| format!("rereading {} rows on {}", self.table.name, conn.id()))
    }
}

/// Holds findings of a recheck instead of reporting them.
#[derive(Default)]
struct RetryCollector {
    failures: Vec<ReportableObject>,
    column_mismatches: Vec<MismatchingColumn>,
}

#[async_trait]
impl RowEventListener for RetryCollector {
    async fn on_extraneous(&mut self, row: ExtraneousRow) {
        self.failures.push(ReportableObject::ExtraneousRow(row));
    }

    async fn on_missing(&mut self, row: MissingRow) {
        self.failures.push(ReportableObject::MissingRow(row));
    }

    async fn on_mismatch(&mut self, row: MismatchingRow) {
        self.failures.push(ReportableObject::MismatchingRow(row));
    }

    async fn on_column_mismatch(&mut self, row: MismatchingColumn, _report_log: bool) {
        self.column_mismatches.push(row);
    }

    async fn on_match(&mut self) {}

    async fn on_row_scan(&mut self) {}
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::datum::Datum;
    use crate::dbconn::{Conn, Dialect, Row};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// A single-table store keyed by an integer first column.
    ///
    /// Answers key lookups (`WHERE (...) IN ((1), (2))`) and keyset scans
    /// (`WHERE (...) > (5) ... LIMIT n`).
    pub struct MemoryConn {
        pub id: &'static str,
        pub rows: Mutex<Vec<Row>>,
        pub queries: Mutex<Vec<String>>,
    }

    impl MemoryConn {
        pub fn new(id: &'static str, rows: Vec<Row>) -> Arc<Self> {
            Arc::new(Self {
                id,
                rows: Mutex::new(rows),
                queries: Mutex::new(Vec::new()),
            })
        }

        pub fn upsert(&self, row: Row) {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|r| r[0] != row[0]);
            rows.push(row);
        }

        pub fn query_count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    fn scan_bounds(sql: &str) -> (Option<i64>, usize) {
        let after = sql.find(") > (").and_then(|i| {
            let rest = &sql[i + 5..];
            rest[..rest.find(')')?].trim().parse().ok()
        });
        let limit = sql
            .rfind("LIMIT ")
            .and_then(|i| sql[i + 6..].trim().parse().ok())
            .unwrap_or(usize::MAX);
        (after, limit)
    }

    fn requested_keys(sql: &str) -> Vec<i64> {
        let start = sql.find(" IN (").map(|i| i + 5).unwrap_or(sql.len());
        let end = sql.rfind(") ORDER BY").unwrap_or(sql.len());
        sql[start..end]
            .split(',')
            .filter_map(|k| k.trim_matches(|c: char| c == '(' || c == ')' || c == ' ').parse().ok())
            .collect()
    }

    #[async_trait]
    impl Conn for MemoryConn {
        fn id(&self) -> &str {
            self.id
        }
        fn dialect(&self) -> Dialect {
            Dialect::CockroachDb
        }
        async fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
            self.queries.lock().unwrap().push(sql.to_string());
            let mut rows = self.rows.lock().unwrap().clone();
            rows.sort_by_key(|r| match r[0] {
                Datum::Int(id) => id,
                _ => i64::MAX,
            });
            let key = |r: &Row| match r[0] {
                Datum::Int(id) => id,
                _ => i64::MAX,
            };
            if sql.contains(" IN (") {
                let keys = requested_keys(sql);
                return Ok(rows.into_iter().filter(|r| keys.contains(&key(r))).collect());
            }
            let (after, limit) = scan_bounds(sql);
            Ok(rows
                .into_iter()
                .filter(|r| after.map_or(true, |a| key(r) > a))
                .take(limit)
                .collect())
        }
        async fn execute(&self, _sql: &str) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn clone_conn(&self) -> anyhow::Result<Arc<dyn Conn>> {
            anyhow::bail!("not supported")
        }
    }
}
