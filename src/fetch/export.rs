// ABOUTME: Exports one table shard through the chunker into a blob store
// ABOUTME: Producer, chunker and store writer run concurrently and fail together

use super::blobstore::{chunk_ext, BlobStore, ChunkUpload, Resource, TestingKnobs};
use super::csv_pipe::{ChunkSink, ChunkWriter, CsvPipe};
use super::pipe::{bounded_pipe, is_pipe_error, pipe, PipeError};
use super::source::ExportSource;
use crate::dbtable::TableShard;
use anyhow::{anyhow, bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Bytes the source may run ahead of the chunker before its writes wait.
pub const SOURCE_PIPE_CAPACITY: usize = 1024 * 1024;

/// Message used by the source-connection failure knob.
pub const FORCED_SOURCE_CONN_ERROR: &str = "forced error when establishing conn for export";

/// Fault injection for the whole export path, used by tests.
#[derive(Debug, Clone, Default)]
pub struct FetchTestingKnobs {
    pub store: TestingKnobs,
    /// Fail the producer before it opens an export session.
    pub fail_establish_src_conn: bool,
}

/// How exported data is cut into chunks.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Flush a chunk once it grows past this many bytes.
    pub flush_size: usize,
    /// Flush a chunk once it holds this many rows; 0 disables the row limit.
    pub flush_rows: usize,
    pub gzip: bool,
}

/// Chunks written for one shard, or for several merged shards of a table.
pub struct ExportResult {
    pub resources: Vec<Arc<dyn Resource>>,
    pub start: Instant,
    pub end: Instant,
    pub num_rows: u64,
}

impl ExportResult {
    /// Combine shard results of one table. Resources come back in key order.
    pub fn merge(results: Vec<ExportResult>) -> Option<ExportResult> {
        let mut iter = results.into_iter();
        let mut merged = iter.next()?;
        for r in iter {
            merged.resources.extend(r.resources);
            merged.start = merged.start.min(r.start);
            merged.end = merged.end.max(r.end);
            merged.num_rows += r.num_rows;
        }
        merged.resources.sort_by(|a, b| a.key().cmp(b.key()));
        Some(merged)
    }
}

/// Errors raised by the three export roles, in arrival order.
#[derive(Clone, Default)]
struct ExportErrors {
    errs: Arc<Mutex<Vec<anyhow::Error>>>,
    failed: Arc<AtomicBool>,
}

impl ExportErrors {
    fn record(&self, err: anyhow::Error) {
        self.failed.store(true, Ordering::SeqCst);
        self.errs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(err);
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The first error that is not just a relayed pipe closure, else the first error.
    fn into_result(self) -> Result<()> {
        let mut errs = std::mem::take(&mut *self.errs.lock().unwrap_or_else(|e| e.into_inner()));
        if errs.is_empty() {
            return Ok(());
        }
        let idx = errs.iter().position(|e| !is_pipe_error(e)).unwrap_or(0);
        Err(errs.swap_remove(idx))
    }
}

fn relayed(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, PipeError(msg.to_string()))
}

/// Export one shard into `store`.
///
/// `chunk_index` is shared by every shard of the table so chunk names never
/// collide; the first chunk is numbered 1. A failure in any role aborts the
/// other two and the root cause is returned. Cancelling `cancel` stops the
/// producer with a "context canceled" error.
pub async fn export_table(
    settings: &ExportSettings,
    source: Arc<dyn ExportSource>,
    store: Arc<dyn BlobStore>,
    shard: TableShard,
    chunk_index: Arc<AtomicUsize>,
    knobs: &FetchTestingKnobs,
    cancel: &CancellationToken,
) -> Result<ExportResult> {
    let start = Instant::now();
    let label = shard.table.name.safe_string();
    let errors = ExportErrors::default();
    let cancel = cancel.child_token();

    let (src_reader, src_writer) = bounded_pipe(SOURCE_PIPE_CAPACITY);
    let src_handle = src_reader.handle();

    // The producer blocks on a full pipe, so it gets a thread of its own
    // rather than stalling a runtime worker.
    let producer = {
        let errors = errors.clone();
        let cancel = cancel.clone();
        let shard = shard.clone();
        let fail_conn = knobs.fail_establish_src_conn;
        let mut src_writer = src_writer;
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            let result: Result<()> = runtime.block_on(async {
                if fail_conn {
                    bail!(FORCED_SOURCE_CONN_ERROR);
                }
                let mut conn = source
                    .conn()
                    .await
                    .context("error establishing connection for export")?;
                let exported = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(anyhow!("context canceled")),
                    r = conn.export(&mut src_writer, &shard) => r,
                };
                let closed = conn.close().await;
                exported?;
                closed
            });
            match result {
                Ok(()) => src_writer.close(),
                Err(e) => {
                    src_writer.close_with_error(format!("{:#}", e));
                    errors.record(e.context("error exporting data"));
                    cancel.cancel();
                }
            }
        })
    };

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<ChunkUpload>(1);

    let store_writer = {
        let errors = errors.clone();
        let cancel = cancel.clone();
        let knobs = knobs.store.clone();
        let label = label.clone();
        tokio::spawn(async move {
            let mut resources: Vec<Arc<dyn Resource>> = Vec::new();
            while let Some(upload) = chunk_rx.recv().await {
                let handle = upload.reader.handle();
                let index = upload.index;
                match store.create_from_reader(upload, &knobs).await {
                    Ok(Some(resource)) => {
                        tracing::debug!(table = %label, key = resource.key(), "chunk stored");
                        resources.push(resource);
                    }
                    Ok(None) => {
                        tracing::debug!(table = %label, batch = index, "chunk written to target");
                    }
                    Err(e) => {
                        tracing::error!(table = %label, batch = index, "error during data store write: {:#}", e);
                        let msg = format!("{:#}", e);
                        errors.record(e);
                        handle.close_with_error(msg);
                        cancel.cancel();
                        break;
                    }
                }
            }
            resources
        })
    };

    let chunker = {
        let errors = errors.clone();
        let table = shard.table.clone();
        let flush_size = settings.flush_size;
        let flush_rows = settings.flush_rows;
        let gzip = settings.gzip;
        let ext = chunk_ext(gzip);
        let label = label.clone();
        tokio::task::spawn_blocking(move || {
            let new_sink = move || -> io::Result<ChunkSink> {
                if errors.failed() {
                    return Err(relayed("export aborted"));
                }
                let (reader, writer) = pipe();
                let (rows_tx, rows_rx) = oneshot::channel();
                let index = chunk_index.fetch_add(1, Ordering::SeqCst) + 1;
                chunk_tx
                    .blocking_send(ChunkUpload {
                        reader,
                        table: table.clone(),
                        index,
                        ext,
                        rows: rows_rx,
                    })
                    .map_err(|_| relayed("blob store writer stopped"))?;
                let writer: Box<dyn ChunkWriter> = if gzip {
                    Box::new(GzEncoder::new(writer, Compression::default()))
                } else {
                    Box::new(writer)
                };
                Ok(ChunkSink {
                    writer,
                    rows: rows_tx,
                })
            };
            CsvPipe::new(src_reader, flush_size, flush_rows, &label, new_sink).run()
        })
    };

    let num_rows = match chunker.await.context("csv chunker task failed")? {
        Ok(n) => n,
        Err(e) => {
            src_handle.close_with_error(format!("{:#}", e));
            errors.record(e);
            cancel.cancel();
            0
        }
    };
    let resources = store_writer.await.context("blob store writer task failed")?;
    producer.await.context("export producer task failed")?;
    errors.into_result()?;

    let end = Instant::now();
    tracing::info!(
        table = %label,
        shard = shard.shard_num,
        num_rows,
        chunks = resources.len(),
        duration = ?(end - start),
        "shard export complete"
    );
    Ok(ExportResult {
        resources,
        start,
        end,
        num_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbtable::testutil::users_table;
    use crate::fetch::blobstore::cloud::testutil::MemoryBucket;
    use crate::fetch::blobstore::{CloudStore, LocalStore, FORCED_WRITE_ERROR};
    use crate::fetch::source::SourceConn;
    use async_trait::async_trait;
    use std::io::{Read, Write};
    use std::time::Duration;

    /// Emits `id,user<id>` rows, optionally failing partway.
    struct FakeSource {
        rows: usize,
        fail_after: Option<usize>,
    }

    struct FakeConn {
        rows: usize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ExportSource for FakeSource {
        fn cdc_cursor(&self) -> &str {
            "0/0"
        }

        async fn conn(&self) -> Result<Box<dyn SourceConn>> {
            Ok(Box::new(FakeConn {
                rows: self.rows,
                fail_after: self.fail_after,
            }))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SourceConn for FakeConn {
        async fn export(&mut self, writer: &mut (dyn Write + Send), _shard: &TableShard) -> Result<()> {
            for i in 1..=self.rows {
                if self.fail_after == Some(i - 1) {
                    bail!("source went away");
                }
                writeln!(writer, "{},user{}", i, i)?;
                tokio::task::yield_now().await;
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    fn source(rows: usize) -> Arc<dyn ExportSource> {
        Arc::new(FakeSource {
            rows,
            fail_after: None,
        })
    }

    fn settings(flush_rows: usize) -> ExportSettings {
        ExportSettings {
            flush_size: 1024 * 1024,
            flush_rows,
            gzip: false,
        }
    }

    async fn run(
        settings: &ExportSettings,
        source: Arc<dyn ExportSource>,
        store: Arc<dyn BlobStore>,
        knobs: &FetchTestingKnobs,
    ) -> Result<ExportResult> {
        tokio::time::timeout(
            Duration::from_secs(20),
            export_table(
                settings,
                source,
                store,
                TableShard::whole(users_table()),
                Arc::new(AtomicUsize::new(0)),
                knobs,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("export deadlocked")
    }

    async fn read_all(resource: &Arc<dyn Resource>) -> String {
        let mut reader = resource.reader().await.unwrap();
        tokio::task::spawn_blocking(move || {
            let mut out = String::new();
            reader.read_to_string(&mut out).unwrap();
            out
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_export_splits_into_row_bounded_chunks() {
        let store = Arc::new(CloudStore::new(MemoryBucket::new(100, true), "base"));
        let result = run(&settings(3), source(20), store, &FetchTestingKnobs::default())
            .await
            .unwrap();

        assert_eq!(result.num_rows, 20);
        let keys: Vec<&str> = result.resources.iter().map(|r| r.key()).collect();
        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0], "base/public.users/part_00000001.csv");
        assert_eq!(keys[6], "base/public.users/part_00000007.csv");
        let rows: Vec<usize> = result.resources.iter().map(|r| r.rows()).collect();
        assert_eq!(rows, vec![3, 3, 3, 3, 3, 3, 2]);
        assert_eq!(read_all(&result.resources[6]).await, "19,user19\n20,user20\n");
    }

    #[tokio::test]
    async fn test_empty_table_writes_nothing() {
        let store = Arc::new(CloudStore::new(MemoryBucket::new(100, true), ""));
        let result = run(&settings(3), source(0), store, &FetchTestingKnobs::default())
            .await
            .unwrap();
        assert_eq!(result.num_rows, 0);
        assert!(result.resources.is_empty());
    }

    #[tokio::test]
    async fn test_store_write_failures_surface_root_cause() {
        for (before, after) in [(true, false), (false, true)] {
            for rows in [0usize, 1, 20] {
                let knobs = FetchTestingKnobs {
                    store: TestingKnobs {
                        fail_before_read: before,
                        fail_after_read: after,
                        message: None,
                    },
                    fail_establish_src_conn: false,
                };
                let store = Arc::new(CloudStore::new(MemoryBucket::new(100, true), ""));
                let result = run(&settings(3), source(rows), store, &knobs).await;
                if rows == 0 {
                    assert!(result.is_ok(), "rows=0 before={} after={}", before, after);
                } else {
                    let err = result.err().unwrap();
                    assert_eq!(
                        err.root_cause().to_string(),
                        FORCED_WRITE_ERROR,
                        "rows={} before={} after={}",
                        rows,
                        before,
                        after
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_local_store_write_failure_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path(), None, None).await.unwrap());
        let knobs = FetchTestingKnobs {
            store: TestingKnobs {
                fail_after_read: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = run(&settings(2), source(20), store, &knobs)
            .await
            .err()
            .unwrap();
        assert_eq!(err.root_cause().to_string(), FORCED_WRITE_ERROR);
    }

    #[tokio::test]
    async fn test_source_conn_failure() {
        let store = Arc::new(CloudStore::new(MemoryBucket::new(100, true), ""));
        let knobs = FetchTestingKnobs {
            fail_establish_src_conn: true,
            ..Default::default()
        };
        let err = run(&settings(3), source(5), store, &knobs)
            .await
            .err()
            .unwrap();
        assert_eq!(err.root_cause().to_string(), FORCED_SOURCE_CONN_ERROR);
    }

    #[tokio::test]
    async fn test_producer_failure_midway() {
        let store = Arc::new(CloudStore::new(MemoryBucket::new(100, true), ""));
        let source = Arc::new(FakeSource {
            rows: 20,
            fail_after: Some(5),
        });
        let err = run(&settings(2), source, store, &FetchTestingKnobs::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.root_cause().to_string(), "source went away");
    }

    #[tokio::test]
    async fn test_cancelled_export() {
        let store: Arc<dyn BlobStore> = Arc::new(CloudStore::new(MemoryBucket::new(100, true), ""));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = export_table(
            &settings(3),
            source(20),
            store,
            TableShard::whole(users_table()),
            Arc::new(AtomicUsize::new(0)),
            &FetchTestingKnobs::default(),
            &cancel,
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.root_cause().to_string(), "context canceled");
    }

    /// Writes `rows` rows of about 1 KiB, counting bytes handed to the writer.
    struct WideSource {
        rows: usize,
        written: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExportSource for WideSource {
        fn cdc_cursor(&self) -> &str {
            "0/0"
        }

        async fn conn(&self) -> Result<Box<dyn SourceConn>> {
            Ok(Box::new(WideSource {
                rows: self.rows,
                written: self.written.clone(),
            }))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SourceConn for WideSource {
        async fn export(&mut self, writer: &mut (dyn Write + Send), _shard: &TableShard) -> Result<()> {
            let pad = "x".repeat(1000);
            for i in 1..=self.rows {
                let line = format!("{},{}\n", i, pad);
                writer.write_all(line.as_bytes())?;
                self.written.fetch_add(line.len(), Ordering::SeqCst);
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    /// Holds every chunk until a permit is released, then drains it.
    struct GatedStore {
        gate: Arc<tokio::sync::Semaphore>,
        stored: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BlobStore for GatedStore {
        async fn create_from_reader(
            &self,
            upload: ChunkUpload,
            _knobs: &TestingKnobs,
        ) -> Result<Option<Arc<dyn Resource>>> {
            self.gate.acquire().await?.forget();
            let mut reader = upload.reader;
            tokio::task::spawn_blocking(move || {
                let mut sink = Vec::new();
                reader.read_to_end(&mut sink)
            })
            .await??;
            self.stored.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        fn can_be_target(&self) -> bool {
            false
        }

        fn default_flush_batch_size(&self) -> usize {
            64 * 1024
        }

        fn telemetry_name(&self) -> &'static str {
            "gated"
        }

        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }

        async fn list_from_continuation_point(
            &self,
            _table: &crate::dbtable::VerifiedTable,
            _file_name: &str,
        ) -> Result<Vec<Arc<dyn Resource>>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_slow_store_stalls_the_source() {
        let rows = 16 * 1024;
        let written = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let stored = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn BlobStore> = Arc::new(GatedStore {
            gate: gate.clone(),
            stored: stored.clone(),
        });
        let source: Arc<dyn ExportSource> = Arc::new(WideSource {
            rows,
            written: written.clone(),
        });

        let export = tokio::spawn(async move {
            let settings = ExportSettings {
                flush_size: 64 * 1024,
                flush_rows: 0,
                gzip: false,
            };
            let knobs = FetchTestingKnobs::default();
            let cancel = CancellationToken::new();
            let shard = TableShard::whole(users_table());
            let counter = Arc::new(AtomicUsize::new(0));
            export_table(&settings, source, store, shard, counter, &knobs, &cancel).await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let ahead = written.load(Ordering::SeqCst);
        assert_eq!(stored.load(Ordering::SeqCst), 0);
        // The source pipe plus the chunks the chunker has in flight, far short of the table.
        assert!(
            ahead <= SOURCE_PIPE_CAPACITY + 512 * 1024,
            "source ran {} bytes ahead of a stalled store",
            ahead
        );
        assert!(ahead < rows * 1000 / 4);

        gate.add_permits(tokio::sync::Semaphore::MAX_PERMITS / 2);
        let result = tokio::time::timeout(Duration::from_secs(30), export)
            .await
            .expect("export deadlocked")
            .unwrap()
            .unwrap();
        assert_eq!(result.num_rows, rows as u64);
        let total: usize = (1..=rows).map(|i| i.to_string().len() + 1002).sum();
        assert_eq!(written.load(Ordering::SeqCst), total);
        assert!(stored.load(Ordering::SeqCst) > 200);
    }

    #[tokio::test]
    async fn test_gzip_chunks_decode() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path(), None, None).await.unwrap());
        let settings = ExportSettings {
            gzip: true,
            ..settings(0)
        };
        let result = run(&settings, source(3), store, &FetchTestingKnobs::default())
            .await
            .unwrap();
        assert_eq!(result.resources.len(), 1);
        assert!(result.resources[0].key().ends_with("part_00000001.tar.gz"));
        // Local chunks lead with their row count.
        assert_eq!(
            read_all(&result.resources[0]).await,
            "3\n1,user1\n2,user2\n3,user3\n"
        );
    }

    #[tokio::test]
    async fn test_shards_share_chunk_numbering() {
        let store: Arc<dyn BlobStore> = Arc::new(CloudStore::new(MemoryBucket::new(100, true), ""));
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let knobs = FetchTestingKnobs::default();
        let s = settings(2);
        let (a, b) = tokio::join!(
            export_table(
                &s,
                source(5),
                store.clone(),
                TableShard::whole(users_table()),
                counter.clone(),
                &knobs,
                &cancel,
            ),
            export_table(
                &s,
                source(4),
                store.clone(),
                TableShard::whole(users_table()),
                counter.clone(),
                &knobs,
                &cancel,
            ),
        );
        let merged = ExportResult::merge(vec![a.unwrap(), b.unwrap()]).unwrap();
        assert_eq!(merged.num_rows, 9);
        let keys: Vec<String> = merged.resources.iter().map(|r| r.key().to_string()).collect();
        let expected: Vec<String> = (1..=5)
            .map(|i| format!("public.users/part_{:08}.csv", i))
            .collect();
        assert_eq!(keys, expected);
    }
}
