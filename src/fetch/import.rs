// ABOUTME: IMPORT INTO bulk loads of staged resources with failure bisection
// ABOUTME: Isolates the first broken file of a failed batch and polls job progress out of band

use super::blobstore::Resource;
use super::status::{ExceptionTracker, STAGE_DATA_LOAD};
use crate::datum::{quote_literal, Datum};
use crate::dbconn::{require_postgres, Conn, Dialect};
use crate::dbtable::VerifiedTable;
use crate::error::{sql_state, MoltError};
use crate::metrics::Metrics;
use crate::utils::extract_file_name;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Locations per IMPORT statement.
pub const BATCH_SIZE: usize = 10;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Query parameters whose values must never reach the logs.
const SECRET_PARAMS: [&str; 3] = ["AWS_SECRET_ACCESS_KEY", "AWS_SESSION_TOKEN", "CREDENTIALS"];

/// Options appended to every IMPORT statement of a table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub gzip: bool,
    /// Skip the row-count line that local-store files start with.
    pub skip_header: bool,
}

/// Build `IMPORT INTO` for a batch of locations. Returns the statement and a
/// copy with credentials redacted.
pub fn import_into(
    table: &VerifiedTable,
    locations: &[String],
    opts: ImportOptions,
) -> (String, String) {
    let build = |locs: Vec<String>| -> String {
        let dialect = Dialect::CockroachDb;
        let mut sql = format!(
            "IMPORT INTO {} ({}) CSV DATA ({})",
            table.name.qualified(dialect),
            table.quoted_columns(dialect).join(", "),
            locs.iter()
                .map(|l| quote_literal(l))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut options = Vec::new();
        if opts.gzip {
            options.push("decompress = 'gzip'");
        }
        if opts.skip_header {
            options.push("skip = '1'");
        }
        if !options.is_empty() {
            sql.push_str(" WITH ");
            sql.push_str(&options.join(", "));
        }
        sql
    };

    let redacted = locations.iter().map(|l| redact_location(l)).collect();
    (build(locations.to_vec()), build(redacted))
}

/// Replace credential values in a location's query string.
pub fn redact_location(location: &str) -> String {
    let Some((base, query)) = location.split_once('?') else {
        return location.to_string();
    };
    let params = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if SECRET_PARAMS.contains(&key) => format!("{}=redacted", key),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", base, params)
}

/// The single location a failed batch was narrowed down to.
#[derive(Debug)]
pub struct BisectFailure {
    pub location: String,
    pub statement: String,
    pub error: anyhow::Error,
}

/// Run IMPORT for `locations`, bisecting on failure.
///
/// Work is an explicit stack of location ranges. When a range fails it is
/// split and the second half pushed before the first, so the first half is
/// retried next and the lowest broken file is always found first:
///
/// ```text
/// [1..10] -> [1..5][6..10] -> [1,2][3..5][6,7][8..10] -> ...
/// ```
///
/// Assumes a failed statement applied nothing. Files of a failed range that
/// are re-run in a smaller range must not have been partially loaded.
pub async fn import_with_bisect(
    conn: &dyn Conn,
    table: &VerifiedTable,
    locations: &[String],
    opts: ImportOptions,
) -> Option<BisectFailure> {
    let mut stack: Vec<&[String]> = vec![locations];
    while let Some(curr) = stack.pop() {
        if curr.is_empty() {
            continue;
        }
        let (sql, redacted) = import_into(table, curr, opts);
        tracing::debug!(table = %table.name, query = %redacted, "running import query");
        let Err(error) = conn.execute(&sql).await else {
            continue;
        };
        if curr.len() > 1 {
            let mid = curr.len() / 2;
            stack.push(&curr[mid..]);
            stack.push(&curr[..mid]);
        } else {
            return Some(BisectFailure {
                location: curr[0].clone(),
                statement: redacted,
                error,
            });
        }
    }
    None
}

/// Turn an isolated failure into an error that carries the file and SQLSTATE.
fn import_error(failure: BisectFailure) -> anyhow::Error {
    let message = failure
        .error
        .chain()
        .find_map(|c| {
            c.downcast_ref::<tokio_postgres::Error>()
                .and_then(|e| e.as_db_error())
                .map(|db| format!("{}; {}", db.message(), db.detail().unwrap_or_default()))
        })
        .unwrap_or_else(|| format!("{:#}", failure.error));
    MoltError::Import {
        file: extract_file_name(&failure.location),
        sql_state: sql_state(&failure.error),
        command: failure.statement,
        message,
    }
    .into()
}

/// Outcome of importing a table.
#[derive(Debug, Clone, Copy)]
pub struct ImportResult {
    pub rows: u64,
    pub duration: Duration,
}

/// Import every resource of a table in batches of `BATCH_SIZE`.
///
/// A broken file aborts the table and is recorded as its continuation point.
pub async fn import_table(
    target: &dyn Conn,
    table: &VerifiedTable,
    resources: &[Arc<dyn Resource>],
    gzip: bool,
    tracker: &mut ExceptionTracker,
    metrics: &Metrics,
) -> Result<ImportResult> {
    let client = require_postgres(target)?.client();
    let start = Instant::now();
    let label = table.name.safe_string();

    let locations = resources
        .iter()
        .map(|r| r.import_url())
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("error building import urls for {}", label))?;
    let opts = ImportOptions {
        gzip,
        skip_header: resources.iter().any(|r| r.has_header()),
    };

    let progress = spawn_progress_poller(target, table, Utc::now(), metrics.clone()).await;

    let mut total = 0u64;
    let mut outcome = Ok(());
    for (batch_idx, batch) in locations.chunks(BATCH_SIZE).enumerate() {
        let first = batch_idx * BATCH_SIZE;
        let rows: u64 = resources[first..first + batch.len()]
            .iter()
            .map(|r| r.rows() as u64)
            .sum();

        if let Some(failure) = import_with_bisect(target, table, batch, opts).await {
            let err = import_error(failure);
            let err = tracker
                .maybe_report(client, err, "", STAGE_DATA_LOAD)
                .await;
            outcome = Err(err.context("error importing data"));
            break;
        }

        total += rows;
        metrics.imported_rows(&label, rows);
        tracing::info!(
            table = %label,
            "imported {} rows for batch for files {} to {}",
            rows,
            first + 1,
            first + batch.len()
        );
    }

    if let Some(handle) = progress {
        handle.abort();
    }
    outcome?;
    Ok(ImportResult {
        rows: total,
        duration: start.elapsed(),
    })
}

/// `SHOW JOBS` query for IMPORT jobs of `table` started after `since`.
///
/// `%` in names is escaped so it cannot act as a LIKE wildcard.
pub fn show_jobs_query(table: &VerifiedTable, since: &str) -> String {
    let escape = |s: &str| s.replace('%', "\\%").trim_matches('"').to_string();
    format!(
        "WITH x as (SHOW JOBS)\n\
         SELECT description, started, fraction_completed\n\
         FROM x\n\
         WHERE job_type='IMPORT'\n    \
         AND description LIKE '%{}.{}(%'\n    \
         AND started > '{}'\n\
         ORDER BY created DESC",
        escape(&table.name.schema),
        escape(&table.name.table),
        since
    )
}

/// Poll `SHOW JOBS` on its own connection until the table's IMPORT reports
/// completion. Returns `None` when no connection could be opened.
async fn spawn_progress_poller(
    target: &dyn Conn,
    table: &VerifiedTable,
    started: DateTime<Utc>,
    metrics: Metrics,
) -> Option<tokio::task::JoinHandle<()>> {
    let conn = match target.clone_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(table = %table.name, "not reporting import progress: {:#}", e);
            return None;
        }
    };
    let query = show_jobs_query(table, &started.format("%Y-%m-%dT%H:%M:%S").to_string());
    let label = table.name.safe_string();

    Some(tokio::spawn(async move {
        let mut prev = 0.0;
        loop {
            match conn.query(&query).await {
                Ok(rows) => {
                    let fraction = rows.first().and_then(|r| r.get(2)).and_then(fraction_of);
                    if let Some(frac) = fraction {
                        if frac >= 1.0 {
                            tracing::debug!(table = %label, "import job complete");
                            return;
                        }
                        if frac != 0.0 && frac != prev {
                            tracing::info!(
                                table = %label,
                                completion = %format!("{:.2}%", frac * 100.0),
                                "progress"
                            );
                            metrics.completion_percentage(&label, frac * 100.0);
                        }
                        prev = frac;
                    }
                }
                Err(e) => tracing::debug!(table = %label, "progress query failed: {:#}", e),
            }
            tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;
        }
    }))
}

fn fraction_of(datum: &Datum) -> Option<f64> {
    use rust_decimal::prelude::ToPrimitive;
    match datum {
        Datum::Float(f) => Some(*f),
        Datum::Decimal(d) => d.to_f64(),
        Datum::Text(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbconn::Row;
    use crate::dbtable::testutil::users_table;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every IMPORT that mentions one of the broken files.
    struct ImportConn {
        broken: Vec<String>,
        statements: Mutex<Vec<String>>,
    }

    impl ImportConn {
        fn new(broken: &[usize]) -> Self {
            Self {
                broken: broken.iter().map(|i| file(*i)).collect(),
                statements: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Conn for ImportConn {
        fn id(&self) -> &str {
            "target"
        }
        fn dialect(&self) -> Dialect {
            Dialect::CockroachDb
        }
        async fn query(&self, _sql: &str) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn execute(&self, sql: &str) -> Result<u64> {
            self.statements.lock().unwrap().push(sql.to_string());
            if let Some(bad) = self.broken.iter().find(|b| sql.contains(b.as_str())) {
                anyhow::bail!("error parsing {}", bad);
            }
            Ok(0)
        }
        async fn clone_conn(&self) -> Result<Arc<dyn Conn>> {
            anyhow::bail!("not supported")
        }
    }

    fn file(i: usize) -> String {
        format!("part_{:08}.csv", i)
    }

    fn locations(n: usize) -> Vec<String> {
        (1..=n)
            .map(|i| format!("http://10.0.0.1:4040/public.users/{}", file(i)))
            .collect()
    }

    async fn bisect(n: usize, broken: &[usize]) -> Option<String> {
        let conn = ImportConn::new(broken);
        import_with_bisect(&conn, &users_table(), &locations(n), ImportOptions::default())
            .await
            .map(|f| extract_file_name(&f.location))
    }

    #[tokio::test]
    async fn test_bisect_finds_single_broken_file() {
        assert_eq!(bisect(10, &[6]).await.as_deref(), Some("part_00000006.csv"));
        assert_eq!(bisect(10, &[1]).await.as_deref(), Some("part_00000001.csv"));
        assert_eq!(bisect(10, &[10]).await.as_deref(), Some("part_00000010.csv"));
        assert_eq!(bisect(1, &[1]).await.as_deref(), Some("part_00000001.csv"));
    }

    #[tokio::test]
    async fn test_bisect_returns_lowest_broken_file() {
        assert_eq!(bisect(10, &[3, 5]).await.as_deref(), Some("part_00000003.csv"));
        assert_eq!(bisect(10, &[9, 2, 7]).await.as_deref(), Some("part_00000002.csv"));
        assert_eq!(bisect(7, &[5, 6]).await.as_deref(), Some("part_00000005.csv"));
    }

    #[tokio::test]
    async fn test_bisect_every_subset_of_small_batch() {
        let n = 6;
        for mask in 1u32..(1 << n) {
            let broken: Vec<usize> = (1..=n).filter(|i| mask & (1 << (i - 1)) != 0).collect();
            let lowest = broken[0];
            assert_eq!(
                bisect(n, &broken).await,
                Some(file(lowest)),
                "broken set {:?}",
                broken
            );
        }
    }

    #[tokio::test]
    async fn test_bisect_repeated_runs_isolate_every_failure() {
        let mut remaining = vec![2, 5, 9];
        let mut locs = locations(10);
        let mut found = Vec::new();
        while let Some(f) = {
            let conn = ImportConn::new(&remaining);
            import_with_bisect(&conn, &users_table(), &locs, ImportOptions::default()).await
        } {
            let name = extract_file_name(&f.location);
            found.push(name.clone());
            locs.retain(|l| !l.ends_with(&name));
            remaining.retain(|i| file(*i) != name);
        }
        assert_eq!(
            found,
            vec![file(2), file(5), file(9)]
        );
    }

    #[tokio::test]
    async fn test_bisect_success_issues_single_statement() {
        let conn = ImportConn::new(&[]);
        let failure =
            import_with_bisect(&conn, &users_table(), &locations(10), ImportOptions::default())
                .await;
        assert!(failure.is_none());
        assert_eq!(conn.statements.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_import_statement_options() {
        let table = users_table();
        let locs = vec!["http://h/public.users/part_00000001.csv".to_string()];
        let (sql, _) = import_into(&table, &locs, ImportOptions::default());
        assert_eq!(
            sql,
            "IMPORT INTO \"public\".\"users\" (\"id\", \"name\") CSV DATA \
             ('http://h/public.users/part_00000001.csv')"
        );

        let (sql, _) = import_into(
            &table,
            &locs,
            ImportOptions {
                gzip: true,
                skip_header: true,
            },
        );
        assert!(sql.ends_with("WITH decompress = 'gzip', skip = '1'"));
    }

    #[test]
    fn test_import_statement_redacts_credentials() {
        let table = users_table();
        let locs = vec![
            "s3://b/k.csv?AWS_ACCESS_KEY_ID=AKIA&AWS_SECRET_ACCESS_KEY=shh&AWS_SESSION_TOKEN=tok"
                .to_string(),
            "gs://b/k.csv?CREDENTIALS=e30=".to_string(),
        ];
        let (sql, redacted) = import_into(&table, &locs, ImportOptions::default());
        assert!(sql.contains("AWS_SECRET_ACCESS_KEY=shh"));
        assert!(redacted.contains("AWS_ACCESS_KEY_ID=AKIA"));
        assert!(redacted.contains("AWS_SECRET_ACCESS_KEY=redacted"));
        assert!(redacted.contains("AWS_SESSION_TOKEN=redacted"));
        assert!(redacted.contains("CREDENTIALS=redacted"));
        assert!(!redacted.contains("shh"));
    }

    #[test]
    fn test_import_error_carries_file() {
        let err = import_error(BisectFailure {
            location: "http://h/public.users/part_00000006.csv".to_string(),
            statement: "IMPORT INTO ...".to_string(),
            error: anyhow::anyhow!("bad row"),
        });
        match err.downcast_ref::<MoltError>() {
            Some(MoltError::Import { file, command, .. }) => {
                assert_eq!(file, "part_00000006.csv");
                assert_eq!(command, "IMPORT INTO ...");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_show_jobs_query() {
        let mut table = users_table();
        table.name.table = "test1".to_string();
        assert_eq!(
            show_jobs_query(&table, "2006-01-02T15:04:05"),
            "WITH x as (SHOW JOBS)\n\
             SELECT description, started, fraction_completed\n\
             FROM x\n\
             WHERE job_type='IMPORT'\n    AND description LIKE '%public.test1(%'\n    \
             AND started > '2006-01-02T15:04:05'\n\
             ORDER BY created DESC"
        );

        table.name.table = "test%1".to_string();
        assert!(show_jobs_query(&table, "t").contains("LIKE '%public.test\\%1(%'"));
    }
}
