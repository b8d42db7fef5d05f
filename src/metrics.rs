// ABOUTME: Injected metrics collector for fetch and verify runs
// ABOUTME: Components report through a trait object instead of global counters

use crate::verify::inconsistency::RowStats;
use std::sync::Arc;
use std::time::Duration;

/// Receives run measurements. Implementations must be cheap and non-blocking.
pub trait MetricsCollector: Send + Sync {
    fn exported_rows(&self, table: &str, rows: u64);
    fn imported_rows(&self, table: &str, rows: u64);
    fn completion_percentage(&self, table: &str, pct: f64);
    fn table_duration(&self, table: &str, duration: Duration);
    fn verify_stats(&self, table: &str, stats: &RowStats);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn exported_rows(&self, _table: &str, _rows: u64) {}
    fn imported_rows(&self, _table: &str, _rows: u64) {}
    fn completion_percentage(&self, _table: &str, _pct: f64) {}
    fn table_duration(&self, _table: &str, _duration: Duration) {}
    fn verify_stats(&self, _table: &str, _stats: &RowStats) {}
}

/// Emits every measurement as a debug-level tracing event under the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsCollector for TracingMetrics {
    fn exported_rows(&self, table: &str, rows: u64) {
        tracing::debug!(target: "metrics", table, rows, "exported_rows");
    }

    fn imported_rows(&self, table: &str, rows: u64) {
        tracing::debug!(target: "metrics", table, rows, "imported_rows");
    }

    fn completion_percentage(&self, table: &str, pct: f64) {
        tracing::debug!(target: "metrics", table, pct, "completion_percentage");
    }

    fn table_duration(&self, table: &str, duration: Duration) {
        tracing::debug!(
            target: "metrics",
            table,
            seconds = duration.as_secs_f64(),
            "table_duration"
        );
    }

    fn verify_stats(&self, table: &str, stats: &RowStats) {
        tracing::debug!(
            target: "metrics",
            table,
            verified = stats.num_verified,
            success = stats.num_success,
            missing = stats.num_missing,
            mismatch = stats.num_mismatch,
            extraneous = stats.num_extraneous,
            live_retry = stats.num_live_retry,
            column_mismatch = stats.num_column_mismatch,
            "verify_stats"
        );
    }
}

/// Shared handle used throughout the crate.
pub type Metrics = Arc<dyn MetricsCollector>;

pub fn noop() -> Metrics {
    Arc::new(NoopMetrics)
}
