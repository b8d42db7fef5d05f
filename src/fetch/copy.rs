// ABOUTME: Streaming COPY FROM STDIN into a Postgres-wire target
// ABOUTME: Used by the direct-copy store and by the copy load path for staged resources

use super::blobstore::Resource;
use super::status::{ExceptionTracker, STAGE_DATA_LOAD};
use crate::dbconn::{require_postgres, Conn};
use crate::dbtable::VerifiedTable;
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::SinkExt;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_postgres::Client;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// `COPY "schema"."table" ("a", "b") FROM STDIN ...`.
///
/// With `header` the first line of the input is skipped.
pub fn copy_from_sql(table: &VerifiedTable, header: bool) -> String {
    let dialect = crate::dbconn::Dialect::Postgres;
    let base = format!(
        "COPY {} ({}) FROM STDIN",
        table.name.qualified(dialect),
        table.quoted_columns(dialect).join(", ")
    );
    if header {
        format!("{} WITH (FORMAT CSV, HEADER)", base)
    } else {
        format!("{} CSV", base)
    }
}

/// Feed a blocking reader into `COPY ... FROM STDIN`. Returns rows copied.
///
/// The reader is drained on the blocking pool in 1 MiB pieces. If the COPY
/// fails first, the reader is dropped, which closes a pipe reader with an
/// error its writer will see.
pub async fn copy_from_reader(
    client: &Client,
    sql: &str,
    reader: Box<dyn Read + Send>,
) -> Result<u64> {
    let (tx, mut rx) = mpsc::channel::<std::io::Result<Bytes>>(2);
    let feeder = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        loop {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let piece = match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            let failed = piece.is_err();
            if tx.blocking_send(piece).is_err() || failed {
                return;
            }
        }
    });

    let result: Result<u64> = async {
        let sink = client
            .copy_in::<_, Bytes>(sql)
            .await
            .context("error starting COPY")?;
        futures::pin_mut!(sink);
        while let Some(piece) = rx.recv().await {
            let piece = piece.context("error reading copy input")?;
            sink.send(piece).await.context("error sending copy data")?;
        }
        sink.finish().await.context("error finishing COPY")
    }
    .await;

    // Unblock the feeder if COPY bailed out early.
    drop(rx);
    feeder.await.context("copy feeder task failed")?;
    result
}

/// Outcome of loading a table through COPY.
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    pub rows: u64,
    pub duration: Duration,
}

/// Stream every resource into the target with COPY, in order.
///
/// A failing resource is recorded as a continuation point for the table.
pub async fn copy_table(
    target: &dyn Conn,
    table: &VerifiedTable,
    resources: &[Arc<dyn Resource>],
    tracker: &mut ExceptionTracker,
    metrics: &Metrics,
) -> Result<CopyResult> {
    let client = require_postgres(target)?.client();
    let start = Instant::now();
    let label = table.name.safe_string();
    let mut rows_so_far = 0u64;

    for (idx, resource) in resources.iter().enumerate() {
        tracing::debug!(table = %label, idx = idx + 1, "reading resource");
        let outcome: Result<u64> = async {
            let reader = resource.reader().await?;
            let sql = copy_from_sql(table, resource.has_header());
            tracing::debug!(table = %label, idx = idx + 1, "running copy from resource");
            copy_from_reader(client, &sql, reader).await
        }
        .await;

        match outcome {
            Ok(rows) => {
                rows_so_far += rows;
                metrics.imported_rows(&label, rows);
                tracing::info!(
                    table = %label,
                    file = resource.key(),
                    num_rows = rows_so_far,
                    "row copy status"
                );
            }
            Err(e) => {
                let file_name = resource.key().rsplit('/').next().unwrap_or_default();
                let e = tracker
                    .maybe_report(client, e, file_name, STAGE_DATA_LOAD)
                    .await;
                return Err(e.context(format!("error copying {} into {}", resource.key(), label)));
            }
        }
    }

    let duration = start.elapsed();
    tracing::info!(table = %label, duration = ?duration, "table COPY complete");
    Ok(CopyResult {
        rows: rows_so_far,
        duration,
    })
}
