// ABOUTME: Snapshot-consistent export sources that write CSV for one shard at a time
// ABOUTME: PostgreSQL and CockroachDB use COPY TO; MySQL scans with a RowIterator

use crate::datum::{quote_literal, Datum};
use crate::dbconn::{require_mysql, require_postgres, Conn, Dialect};
use crate::dbtable::{Side, TableShard};
use crate::rowiterator::{query::export_query, RowIterator, RowStream};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{pin_mut, TryStreamExt};
use std::io::Write;
use std::sync::Arc;

const GTID_HELP: &str = "please ensure that you have GTID-based replication enabled";

/// Settings shared by every export source.
#[derive(Debug, Clone)]
pub struct ExportSourceSettings {
    /// Rows per page when a source scans with a RowIterator.
    pub row_batch_size: usize,
}

impl Default for ExportSourceSettings {
    fn default() -> Self {
        Self {
            row_batch_size: 100_000,
        }
    }
}

/// A point-in-time view of the source that hands out export connections.
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// Where change capture can pick up once the export is loaded.
    fn cdc_cursor(&self) -> &str;

    /// A connection reading from the source's snapshot.
    async fn conn(&self) -> Result<Box<dyn SourceConn>>;

    /// Release the snapshot.
    async fn close(&self) -> Result<()>;
}

/// One export session.
#[async_trait]
pub trait SourceConn: Send {
    /// Write every row of `shard` to `writer` as CSV without a header.
    async fn export(&mut self, writer: &mut (dyn Write + Send), shard: &TableShard) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Pick the export source for the source connection's dialect and pin its snapshot.
pub async fn infer_export_source(
    settings: &ExportSourceSettings,
    conn: Arc<dyn Conn>,
) -> Result<Arc<dyn ExportSource>> {
    let source: Arc<dyn ExportSource> = match conn.dialect() {
        Dialect::Postgres => Arc::new(PgSource::new(conn).await?),
        Dialect::CockroachDb => Arc::new(CrdbSource::new(conn).await?),
        Dialect::MySql => Arc::new(MySqlSource::new(settings.clone(), conn).await?),
    };
    tracing::info!(cdc_cursor = source.cdc_cursor(), "established export snapshot");
    Ok(source)
}

/// Stream `COPY (SELECT ...) TO STDOUT CSV` for a shard into `writer`.
async fn copy_to(conn: &dyn Conn, writer: &mut (dyn Write + Send), shard: &TableShard) -> Result<()> {
    let client = require_postgres(conn)?.client();
    let sql = format!(
        "COPY ({}) TO STDOUT CSV",
        export_query(conn.dialect(), shard, &shard.table.source_types)
    );
    tracing::debug!(table = %shard.table.name, sql = %sql, "running export");
    let stream = client
        .copy_out(sql.as_str())
        .await
        .with_context(|| format!("error starting export of {}", shard.table.name))?;
    pin_mut!(stream);
    while let Some(bytes) = stream
        .try_next()
        .await
        .with_context(|| format!("error exporting {}", shard.table.name))?
    {
        writer.write_all(&bytes)?;
    }
    Ok(())
}

/// PostgreSQL: a REPEATABLE READ transaction exports its snapshot, which
/// every export session adopts.
pub struct PgSource {
    holder: Arc<dyn Conn>,
    snapshot_id: String,
    cursor: String,
}

impl PgSource {
    pub async fn new(conn: Arc<dyn Conn>) -> Result<Self> {
        let holder = conn.clone_conn().await?;
        let client = require_postgres(holder.as_ref())?.client();
        client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await
            .context("Failed to open snapshot transaction")?;
        let row = client
            .query_one(
                "SELECT pg_export_snapshot(), pg_current_wal_insert_lsn()::TEXT",
                &[],
            )
            .await
            .context("Failed to export snapshot")?;
        Ok(Self {
            snapshot_id: row.try_get(0)?,
            cursor: row.try_get(1)?,
            holder,
        })
    }
}

#[async_trait]
impl ExportSource for PgSource {
    fn cdc_cursor(&self) -> &str {
        &self.cursor
    }

    async fn conn(&self) -> Result<Box<dyn SourceConn>> {
        let conn = self.holder.clone_conn().await?;
        require_postgres(conn.as_ref())?
            .client()
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; SET TRANSACTION SNAPSHOT {}",
                quote_literal(&self.snapshot_id)
            ))
            .await
            .with_context(|| format!("Failed to adopt snapshot {}", self.snapshot_id))?;
        Ok(Box::new(TxSourceConn { conn }))
    }

    async fn close(&self) -> Result<()> {
        self.holder.execute("ROLLBACK").await?;
        Ok(())
    }
}

/// CockroachDB: every session reads as of one cluster timestamp.
pub struct CrdbSource {
    conn: Arc<dyn Conn>,
    aost: String,
}

impl CrdbSource {
    pub async fn new(conn: Arc<dyn Conn>) -> Result<Self> {
        let rows = conn
            .query("SELECT cluster_logical_timestamp()::STRING")
            .await
            .context("Failed to read cluster timestamp")?;
        let aost = match rows.first().and_then(|r| r.first()) {
            Some(Datum::Text(ts)) => ts.clone(),
            other => bail!("unexpected cluster timestamp {:?}", other),
        };
        Ok(Self { conn, aost })
    }
}

#[async_trait]
impl ExportSource for CrdbSource {
    fn cdc_cursor(&self) -> &str {
        &self.aost
    }

    async fn conn(&self) -> Result<Box<dyn SourceConn>> {
        let conn = self.conn.clone_conn().await?;
        require_postgres(conn.as_ref())?
            .client()
            .batch_execute(&format!(
                "BEGIN AS OF SYSTEM TIME {}",
                quote_literal(&self.aost)
            ))
            .await
            .with_context(|| format!("Failed to begin transaction as of {}", self.aost))?;
        Ok(Box::new(TxSourceConn { conn }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A Postgres-wire session inside a read-only snapshot transaction.
struct TxSourceConn {
    conn: Arc<dyn Conn>,
}

#[async_trait]
impl SourceConn for TxSourceConn {
    async fn export(&mut self, writer: &mut (dyn Write + Send), shard: &TableShard) -> Result<()> {
        copy_to(self.conn.as_ref(), writer, shard).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.execute("ROLLBACK").await?;
        Ok(())
    }
}

/// MySQL: each session opens its own consistent snapshot; the GTID set is the cursor.
pub struct MySqlSource {
    settings: ExportSourceSettings,
    conn: Arc<dyn Conn>,
    gtid: String,
}

impl MySqlSource {
    pub async fn new(settings: ExportSourceSettings, conn: Arc<dyn Conn>) -> Result<Self> {
        let rows = conn
            .query(
                "SELECT source_uuid, MIN(interval_start), MAX(interval_end) \
                 FROM mysql.gtid_executed GROUP BY source_uuid",
            )
            .await
            .with_context(|| format!("failed to export snapshot: {}", GTID_HELP))?;
        let gtid = match rows.first().map(Vec::as_slice) {
            Some([Datum::Text(source), Datum::Int(start), Datum::Int(end)]) => {
                format!("{}:{}-{}", source, start, end)
            }
            _ => return Err(anyhow!("failed to export snapshot: {}", GTID_HELP)),
        };
        Ok(Self {
            settings,
            conn,
            gtid,
        })
    }
}

#[async_trait]
impl ExportSource for MySqlSource {
    fn cdc_cursor(&self) -> &str {
        &self.gtid
    }

    async fn conn(&self) -> Result<Box<dyn SourceConn>> {
        let conn = self.conn.clone_conn().await?;
        require_mysql(conn.as_ref())?.begin_consistent_snapshot().await?;
        Ok(Box::new(ScanSourceConn {
            conn,
            row_batch_size: self.settings.row_batch_size,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Scans a shard page by page and writes it through a CSV encoder.
struct ScanSourceConn {
    conn: Arc<dyn Conn>,
    row_batch_size: usize,
}

#[async_trait]
impl SourceConn for ScanSourceConn {
    async fn export(&mut self, writer: &mut (dyn Write + Send), shard: &TableShard) -> Result<()> {
        scan_to_csv(self.conn.clone(), writer, shard, self.row_batch_size).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.execute("COMMIT").await?;
        Ok(())
    }
}

/// Write every row a RowIterator yields for `shard` as a CSV record.
pub async fn scan_to_csv(
    conn: Arc<dyn Conn>,
    writer: &mut (dyn Write + Send),
    shard: &TableShard,
    row_batch_size: usize,
) -> Result<()> {
    let mut csv = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    let mut it = RowIterator::new(conn, shard.clone(), Side::Source, row_batch_size);
    while it.has_next().await {
        if let Some(row) = it.next() {
            csv.write_record(row.iter().map(Datum::to_csv_field))
                .context("error writing export record")?;
        }
    }
    if let Some(e) = it.error() {
        return Err(anyhow!("{:#}", e));
    }
    csv.flush().context("error flushing export")?;
    Ok(())
}
