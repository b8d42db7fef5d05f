// ABOUTME: Fetch driver - bulk-moves every verified table from source to target
// ABOUTME: Exports through a blob store, loads with IMPORT or COPY, and records continuation tokens

pub mod blobstore;
pub mod copy;
pub mod csv_pipe;
pub mod export;
pub mod import;
pub mod pipe;
pub mod source;
pub mod status;

use crate::config::{FetchConfig, StoreConfig};
use crate::dbconn::{require_postgres, Conn};
use crate::dbtable::catalog::{diff_tables, load_tables, NameFilter};
use crate::dbtable::split::split_table;
use crate::dbtable::VerifiedTable;
use crate::error::MoltError;
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use blobstore::{BlobStore, CloudStore, DirectCopyStore, GcsBucket, LocalStore, Resource, S3Bucket};
use chrono::Utc;
use export::{export_table, ExportResult, ExportSettings, FetchTestingKnobs};
use source::{infer_export_source, ExportSource, ExportSourceSettings};
use status::{ExceptionLog, ExceptionTracker, FetchStatus};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How staged chunks reach the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMethod {
    /// `IMPORT INTO` from the store's URLs; the table is offline while it runs.
    Import,
    /// `COPY FROM STDIN`, one resource at a time.
    Copy,
    /// The store already wrote the rows into the target.
    None,
}

impl LoadMethod {
    /// IMPORT only works into CockroachDB and only when not running live.
    pub fn choose(store_can_be_target: bool, live: bool, target_supports_import: bool) -> Self {
        if !store_can_be_target {
            LoadMethod::None
        } else if live || !target_supports_import {
            LoadMethod::Copy
        } else {
            LoadMethod::Import
        }
    }
}

/// Build the store a fetch stages chunks in.
pub async fn open_store(config: &StoreConfig, target: Arc<dyn Conn>) -> Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match config {
        StoreConfig::S3(settings) => {
            let path = settings.path.clone();
            Arc::new(CloudStore::new(S3Bucket::new(settings).await?, &path))
        }
        StoreConfig::Gcs(settings) => {
            Arc::new(CloudStore::new(GcsBucket::new(settings)?, &settings.path))
        }
        StoreConfig::Local {
            path,
            listen_addr,
            access_addr,
        } => Arc::new(LocalStore::new(path, listen_addr.as_deref(), access_addr.as_deref()).await?),
        StoreConfig::Direct => Arc::new(DirectCopyStore::new(target)),
    };
    tracing::info!(store = store.telemetry_name(), "opened data store");
    Ok(store)
}

/// What a finished fetch reports.
#[derive(Debug, Clone)]
pub struct FetchSummary {
    pub fetch_id: Uuid,
    pub tables: Vec<String>,
    pub cdc_cursor: String,
    pub duration: Duration,
}

/// Everything a table worker needs, shared across workers.
struct FetchContext {
    cfg: FetchConfig,
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    export_source: Arc<dyn ExportSource>,
    store: Arc<dyn BlobStore>,
    knobs: FetchTestingKnobs,
    metrics: Metrics,
    cancel: CancellationToken,
    fetch_id: Uuid,
    export_settings: ExportSettings,
    load_method: LoadMethod,
}

/// Move every table that matches the filter from `source` into `target`.
///
/// A fresh run clears old continuation tokens and creates a new run entry.
/// With a fetch id the run resumes: only tables with a logged failure are
/// loaded, from the staged files at and after the failing one. The first
/// table error stops the run; its status is then FAILED and the fetch id to
/// resume with is logged.
pub async fn fetch(
    cfg: &FetchConfig,
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    store: Arc<dyn BlobStore>,
    knobs: FetchTestingKnobs,
    metrics: Metrics,
    cancel: CancellationToken,
) -> Result<FetchSummary> {
    cfg.validate()?;
    let started = Instant::now();
    let client = require_postgres(target.as_ref())?.client();

    status::create_status_and_exception_tables(client).await?;
    let mut fetch_status = init_status_entry(cfg, client, source.as_ref()).await?;
    let fetch_id = fetch_status.id;

    let result = run_fetch(
        cfg,
        source,
        target.clone(),
        store.clone(),
        knobs,
        metrics,
        cancel,
        fetch_id,
    )
    .await;

    let marked = match &result {
        Ok(_) => fetch_status.mark_successful(client).await,
        Err(_) => {
            tracing::info!(fetch_id = %fetch_id, "continue from this fetch ID");
            fetch_status.mark_failed(client).await
        }
    };
    if let Err(e) = marked {
        tracing::error!("Failed to update fetch status: {:#}", e);
    }

    if cfg.cleanup {
        if let Err(e) = store.cleanup().await {
            tracing::error!("error cleaning up data store: {:#}", e);
        }
    }

    let (tables, cdc_cursor) = result?;
    let summary = FetchSummary {
        fetch_id,
        tables,
        cdc_cursor,
        duration: started.elapsed(),
    };
    tracing::info!("");
    tracing::info!("========================================");
    tracing::info!("fetch complete");
    tracing::info!("========================================");
    tracing::info!("Fetch ID: {}", summary.fetch_id);
    tracing::info!("Tables: {} ({})", summary.tables.len(), summary.tables.join(", "));
    tracing::info!("CDC cursor: {}", summary.cdc_cursor);
    tracing::info!("Net duration: {:?}", summary.duration);
    tracing::info!("========================================");
    Ok(summary)
}

async fn init_status_entry(
    cfg: &FetchConfig,
    client: &tokio_postgres::Client,
    source: &dyn Conn,
) -> Result<FetchStatus> {
    let mut fetch_status = FetchStatus::new(
        format!("run at {}", Utc::now().timestamp()),
        source.dialect().as_str(),
    );
    match cfg.continuation.fetch_id() {
        Some(id) => {
            // A resumed run reuses the earlier run's entry.
            fetch_status.id = Uuid::parse_str(id)
                .map_err(|e| MoltError::Continuation(format!("invalid fetch id {}: {}", id, e)))?;
        }
        None => fetch_status.create_entry(client).await?,
    }
    Ok(fetch_status)
}

/// Tokens to resume from, keyed by `schema.table`. Empty on a fresh run.
async fn exception_log_mapping(
    cfg: &FetchConfig,
    client: &tokio_postgres::Client,
) -> Result<HashMap<String, ExceptionLog>> {
    let cont = &cfg.continuation;
    let Some(fetch_id) = cont.fetch_id() else {
        return Ok(HashMap::new());
    };

    let logs = match cont.token() {
        Some(token) => {
            let mut log = status::get_exception_log_by_token(client, token).await?;
            if let Some(file_name) = cont.file_name() {
                log.file_name = file_name.to_string();
            }
            vec![log]
        }
        None => {
            let id = Uuid::parse_str(fetch_id).map_err(|e| {
                MoltError::Continuation(format!("invalid fetch id {}: {}", fetch_id, e))
            })?;
            status::get_all_exception_logs_by_fetch_id(client, id).await?
        }
    };

    let mapping = status::table_to_exception_log(logs);
    if mapping.is_empty() {
        let msg = match cont.token() {
            Some(token) => format!(
                "no exception logs that correspond to continuation-token of {}",
                token
            ),
            None => format!("no exception logs that correspond to fetch-id of {}", fetch_id),
        };
        return Err(MoltError::Continuation(msg).into());
    }
    Ok(mapping)
}

#[allow(clippy::too_many_arguments)]
async fn run_fetch(
    cfg: &FetchConfig,
    source: Arc<dyn Conn>,
    target: Arc<dyn Conn>,
    store: Arc<dyn BlobStore>,
    knobs: FetchTestingKnobs,
    metrics: Metrics,
    cancel: CancellationToken,
    fetch_id: Uuid,
) -> Result<(Vec<String>, String)> {
    let client = require_postgres(target.as_ref())?.client();
    let flush_size = cfg
        .flush_size
        .unwrap_or_else(|| store.default_flush_batch_size());
    tracing::debug!(
        flush_size,
        flush_num_rows = cfg.flush_rows,
        store = store.telemetry_name(),
        "initial config"
    );

    tracing::info!("checking database details");
    let filter = NameFilter::new(&cfg.filter.schema, &cfg.filter.table)?;
    let source_tables = load_tables(source.as_ref()).await?;
    let target_tables = load_tables(target.as_ref()).await?;
    let diff = diff_tables(&source_tables, &target_tables);

    for name in diff.extraneous.iter().filter(|n| filter.matches(n)) {
        tracing::warn!(table = %name, "ignoring table as it is missing a definition on the source");
    }
    for name in diff.missing.iter().filter(|n| filter.matches(n)) {
        tracing::warn!(table = %name, "ignoring table as it is missing a definition on the target");
    }
    for (name, reason) in diff.mismatching.iter().filter(|(n, _)| filter.matches(n)) {
        tracing::warn!(table = %name, reason = %reason, "table definitions mismatch");
    }
    let tables: Vec<VerifiedTable> = diff
        .verified
        .into_iter()
        .filter(|t| filter.matches(&t.name))
        .collect();
    for table in &tables {
        tracing::info!(table = %table.name, "found matching table");
    }

    let mapping = exception_log_mapping(cfg, client).await?;
    if !cfg.continuation.is_resume() {
        // Only one set of tokens is live at a time.
        status::delete_all_exception_logs(client).await?;
    }

    tracing::info!("establishing snapshot");
    let export_source = infer_export_source(
        &ExportSourceSettings {
            row_batch_size: cfg.row_batch_size,
        },
        source.clone(),
    )
    .await?;
    let cdc_cursor = export_source.cdc_cursor().to_string();
    tracing::info!(num_tables = tables.len(), cdc_cursor = %cdc_cursor, "starting fetch");

    let ctx = Arc::new(FetchContext {
        cfg: cfg.clone(),
        load_method: LoadMethod::choose(store.can_be_target(), cfg.live, target.is_target_dialect()),
        source,
        target,
        export_source: export_source.clone(),
        store,
        knobs,
        metrics,
        cancel: cancel.child_token(),
        fetch_id,
        export_settings: ExportSettings {
            flush_size,
            flush_rows: cfg.flush_rows,
            gzip: cfg.gzip(),
        },
    });

    let result = run_workers(ctx, tables, mapping).await;

    if let Err(e) = export_source.close().await {
        tracing::error!("error closing export source: {:#}", e);
    }
    result.map(|tables| (tables, cdc_cursor))
}

/// Feed tables to `concurrency` workers. The first failure cancels the rest.
async fn run_workers(
    ctx: Arc<FetchContext>,
    tables: Vec<VerifiedTable>,
    mapping: HashMap<String, ExceptionLog>,
) -> Result<Vec<String>> {
    let (tx, rx) = mpsc::channel::<VerifiedTable>(tables.len().max(1));
    for table in tables {
        // Capacity covers every table, so this never waits.
        if tx.send(table).await.is_err() {
            break;
        }
    }
    drop(tx);

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mapping = Arc::new(mapping);
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut workers = JoinSet::new();
    for _ in 0..ctx.cfg.concurrency {
        let ctx = ctx.clone();
        let rx = rx.clone();
        let mapping = mapping.clone();
        let processed = processed.clone();
        workers.spawn(async move {
            loop {
                if ctx.cancel.is_cancelled() {
                    return Ok(());
                }
                let Some(table) = rx.lock().await.recv().await else {
                    return Ok(());
                };
                let key = table.name.safe_string();
                let exception = mapping.get(&key).cloned();
                if ctx.cfg.continuation.is_resume() && exception.is_none() {
                    tracing::warn!(table = %key, "skipping fetch for {}", key);
                    continue;
                }
                if let Err(e) = fetch_table(&ctx, table, exception).await {
                    ctx.cancel.cancel();
                    return Err(e.context(format!("error fetching table {}", key)));
                }
                processed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(key);
            }
        });
    }

    let mut first_err: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        let outcome = joined.context("fetch worker panicked").and_then(|r| r);
        if let Err(e) = outcome {
            if first_err.is_none() {
                first_err = Some(e);
            } else {
                tracing::debug!("additional fetch error: {:#}", e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    let mut tables = std::mem::take(&mut *processed.lock().unwrap_or_else(|e| e.into_inner()));
    tables.sort();
    Ok(tables)
}

async fn fetch_table(
    ctx: &FetchContext,
    table: VerifiedTable,
    exception: Option<ExceptionLog>,
) -> Result<()> {
    let table_start = Instant::now();
    let label = table.name.safe_string();
    let resume = ctx.cfg.continuation.is_resume();

    let target = ctx
        .target
        .clone_conn()
        .await
        .context("unable to clone the target table connection")?;

    if ctx.cfg.truncate && !resume {
        tracing::info!(table = %label, "truncating table");
        target
            .execute(&truncate_sql(&table))
            .await
            .context("failed executing the TRUNCATE TABLE statement")?;
        tracing::info!(table = %label, "finished truncating table");
    } else if ctx.cfg.truncate {
        tracing::warn!(
            table = %label,
            "truncate is skipped because you are using a continuation mode and it could result in missing data"
        );
    }

    tracing::info!(table = %label, "data extraction phase starting");
    let exported = match &exception {
        Some(log) if resume => resume_resources(ctx, &table, log).await?,
        _ => export_shards(ctx, &table).await?,
    };
    let export_duration = exported.end.saturating_duration_since(exported.start);
    ctx.metrics.exported_rows(&label, exported.num_rows);
    tracing::info!(
        table = %label,
        num_rows = exported.num_rows,
        export_duration = ?export_duration,
        "data extraction from source complete"
    );

    let mut tracker = ExceptionTracker::new(ctx.fetch_id, table.name.clone(), exception);
    let loaded = load_table(ctx, target.as_ref(), &table, &exported.resources, &mut tracker).await;

    let import_duration = match loaded {
        Ok(duration) => duration,
        Err(e) => {
            if ctx.cfg.cleanup {
                tracing::info!(
                    table = %label,
                    "skipping cleanup because an error occurred and files may need to be kept for continuation"
                );
            }
            return Err(e);
        }
    };

    if resume {
        if let Some(log) = tracker.existing() {
            log.delete_entry(require_postgres(target.as_ref())?.client())
                .await?;
            tracing::info!(
                table = %label,
                "removing exception log for continuation-token {} because fetch was successful",
                log.id
            );
        }
    }

    if ctx.cfg.cleanup {
        tracing::info!(table = %label, "cleaning up resources created during fetch run");
        for resource in &exported.resources {
            if let Err(e) = resource.mark_for_cleanup().await {
                tracing::error!(table = %label, key = resource.key(), "error cleaning up resource: {:#}", e);
            }
        }
    }

    let net_duration = table_start.elapsed();
    ctx.metrics.table_duration(&label, net_duration);
    tracing::info!(
        table = %label,
        net_duration = ?net_duration,
        import_duration = ?import_duration,
        export_duration = ?export_duration,
        num_rows = exported.num_rows,
        cdc_cursor = ctx.export_source.cdc_cursor(),
        "data import on target for table complete"
    );
    Ok(())
}

fn truncate_sql(table: &VerifiedTable) -> String {
    format!(
        "TRUNCATE TABLE {}",
        table.name.qualified(crate::dbconn::Dialect::Postgres)
    )
}

/// Export every shard of the table concurrently and merge the results.
async fn export_shards(ctx: &FetchContext, table: &VerifiedTable) -> Result<ExportResult> {
    let shard_conn = ctx.source.clone_conn().await?;
    let shards = split_table(shard_conn.as_ref(), table, ctx.cfg.shards)
        .await
        .context("error splitting tables")?;

    let chunk_index = Arc::new(AtomicUsize::new(0));
    let mut set = JoinSet::new();
    for shard in shards {
        let settings = ctx.export_settings.clone();
        let source = ctx.export_source.clone();
        let store = ctx.store.clone();
        let chunk_index = chunk_index.clone();
        let knobs = ctx.knobs.clone();
        let cancel = ctx.cancel.clone();
        set.spawn(async move {
            export_table(&settings, source, store, shard, chunk_index, &knobs, &cancel).await
        });
    }

    let mut results = Vec::new();
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined.context("export task panicked").and_then(|r| r) {
            Ok(r) => results.push(r),
            Err(e) => {
                ctx.cancel.cancel();
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e.context(format!("error exporting {}", table.name)));
    }

    let now = Instant::now();
    Ok(ExportResult::merge(results).unwrap_or(ExportResult {
        resources: Vec::new(),
        start: now,
        end: now,
        num_rows: 0,
    }))
}

/// Staged files of a table from its continuation point onwards.
async fn resume_resources(
    ctx: &FetchContext,
    table: &VerifiedTable,
    log: &ExceptionLog,
) -> Result<ExportResult> {
    if log.file_name.is_empty() {
        tracing::warn!(table = %table.name, "skipping table because no file name is present in the exception log");
        return Err(MoltError::Continuation(format!(
            "table {} not imported because no file name is present in the exception log",
            table.name
        ))
        .into());
    }
    tracing::warn!(table = %table.name, "skipping export for table due to running in import-copy only mode");

    let start = Instant::now();
    let resources = ctx
        .store
        .list_from_continuation_point(table, &log.file_name)
        .await?;
    if resources.is_empty() {
        return Err(MoltError::Continuation(format!(
            "exported resources for table {} is empty, please make sure you did not accidentally delete from the intermediate store",
            table.name
        ))
        .into());
    }
    let num_rows = resources.iter().map(|r| r.rows() as u64).sum();
    Ok(ExportResult {
        resources,
        start,
        end: Instant::now(),
        num_rows,
    })
}

/// Load staged resources with the run's load method. Returns the load duration.
async fn load_table(
    ctx: &FetchContext,
    target: &dyn Conn,
    table: &VerifiedTable,
    resources: &[Arc<dyn Resource>],
    tracker: &mut ExceptionTracker,
) -> Result<Duration> {
    match ctx.load_method {
        LoadMethod::None => Ok(Duration::ZERO),
        LoadMethod::Import => {
            tracing::info!(table = %table.name, "starting data import on target");
            let r = import::import_table(
                target,
                table,
                resources,
                ctx.export_settings.gzip,
                tracker,
                &ctx.metrics,
            )
            .await?;
            Ok(r.duration)
        }
        LoadMethod::Copy => {
            tracing::info!(table = %table.name, "starting data copy on target");
            let r = copy::copy_table(target, table, resources, tracker, &ctx.metrics).await?;
            Ok(r.duration)
        }
    }
}

/// Render the continuation tokens stored on the target.
pub async fn list_tokens(target: &dyn Conn, num_results: i64, json: bool) -> Result<String> {
    let client = require_postgres(target)?.client();
    status::create_status_and_exception_tables(client).await?;
    let logs = status::get_all_exception_logs(client, num_results).await?;
    if json {
        status::format_token_json(&logs)
    } else {
        Ok(status::format_token_table(&logs))
    }
}
