// ABOUTME: Bucket-backed blob store shared by the S3 and GCS clients
// ABOUTME: Spools each chunk to a temp file, uploads it with a numrows tag and lists for resumes

use super::{
    decoded_reader, table_prefix, BlobStore, ChunkUpload, Resource, TestingKnobs,
};
use crate::dbtable::VerifiedTable;
use crate::error::MoltError;
use crate::utils::{chunk_file_name, matches_file_convention};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Metadata key holding a chunk's row count.
pub const NUM_ROWS_KEY: &str = "numrows";

/// Most keys a single batched delete may carry.
pub const MAX_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    /// Row count when the listing already carries metadata.
    pub rows: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub next_token: Option<String>,
}

/// The handful of object operations a cloud store needs.
#[async_trait]
pub trait Bucket: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Upload a file, tagging it with its row count.
    async fn put_file(&self, key: &str, path: &Path, rows: usize) -> Result<()>;

    /// One page of keys under `prefix` that sort at or after `start_at`.
    async fn list_page(
        &self,
        prefix: &str,
        start_at: &str,
        token: Option<String>,
    ) -> Result<ListPage>;

    /// Row count from an object's metadata.
    async fn row_count(&self, key: &str) -> Result<usize>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    fn import_url(&self, key: &str) -> Result<String>;

    fn telemetry_name(&self) -> &'static str;

    /// Queue deletes until `cleanup` instead of issuing one per resource.
    fn batch_deletes(&self) -> bool;
}

pub struct CloudStore<B: Bucket> {
    bucket: Arc<B>,
    base_path: String,
    pending: Arc<Mutex<Vec<String>>>,
}

impl<B: Bucket> CloudStore<B> {
    pub fn new(bucket: B, base_path: &str) -> Self {
        Self {
            bucket: Arc::new(bucket),
            base_path: base_path.trim_matches('/').to_string(),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn bucket(&self) -> &B {
        &self.bucket
    }

    fn resource(&self, key: String, rows: usize) -> Arc<dyn Resource> {
        Arc::new(CloudResource {
            key,
            rows,
            bucket: self.bucket.clone(),
            pending: self.pending.clone(),
        })
    }
}

#[async_trait]
impl<B: Bucket> BlobStore for CloudStore<B> {
    async fn create_from_reader(
        &self,
        upload: ChunkUpload,
        knobs: &TestingKnobs,
    ) -> Result<Option<Arc<dyn Resource>>> {
        knobs.check_before_read()?;

        let ChunkUpload {
            reader,
            table,
            index,
            ext,
            rows,
        } = upload;
        let key = format!(
            "{}/{}",
            table_prefix(&self.base_path, &table),
            chunk_file_name(index, ext)
        );

        let spool = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
            let mut reader = reader;
            let mut file = tempfile::NamedTempFile::new().context("error creating spool file")?;
            std::io::copy(&mut reader, &mut file).context("error reading chunk")?;
            file.flush().context("error flushing spool file")?;
            Ok(file)
        })
        .await
        .context("chunk spooling task failed")??;

        knobs.check_after_read()?;
        let rows = rows.await.context("chunk row count was never reported")?;

        self.bucket
            .put_file(&key, spool.path(), rows)
            .await
            .with_context(|| format!("error uploading {} to {}", key, self.bucket.name()))?;
        tracing::debug!(bucket = self.bucket.name(), key = %key, rows, "uploaded chunk");

        Ok(Some(self.resource(key, rows)))
    }

    fn can_be_target(&self) -> bool {
        true
    }

    fn default_flush_batch_size(&self) -> usize {
        256 * 1024 * 1024
    }

    fn telemetry_name(&self) -> &'static str {
        self.bucket.telemetry_name()
    }

    async fn cleanup(&self) -> Result<()> {
        let keys: Vec<String> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            self.bucket
                .delete(batch)
                .await
                .with_context(|| format!("error deleting {} objects", batch.len()))?;
        }
        if !keys.is_empty() {
            tracing::info!(bucket = self.bucket.name(), deleted = keys.len(), "cleaned up chunks");
        }
        Ok(())
    }

    async fn list_from_continuation_point(
        &self,
        table: &VerifiedTable,
        file_name: &str,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        let prefix = table_prefix(&self.base_path, table);
        let start = format!("{}/{}", prefix, file_name);
        let list_prefix = format!("{}/", prefix);

        let mut found: Vec<(String, usize)> = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .bucket
                .list_page(&list_prefix, &start, token.take())
                .await
                .with_context(|| format!("error listing {}", list_prefix))?;

            for obj in page.objects {
                if obj.key.as_str() < start.as_str() {
                    continue;
                }
                let name = obj.key.rsplit('/').next().unwrap_or_default();
                if !matches_file_convention(name) {
                    continue;
                }
                let rows = match obj.rows {
                    Some(rows) => rows,
                    None => self.bucket.row_count(&obj.key).await?,
                };
                found.push((obj.key, rows));
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if found.is_empty() {
            return Err(MoltError::Continuation(format!(
                "no files for {} at or after {}",
                table.name, file_name
            ))
            .into());
        }
        found.sort();
        Ok(found
            .into_iter()
            .map(|(key, rows)| self.resource(key, rows))
            .collect())
    }
}

pub struct CloudResource<B: Bucket> {
    key: String,
    rows: usize,
    bucket: Arc<B>,
    pending: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl<B: Bucket> Resource for CloudResource<B> {
    fn key(&self) -> &str {
        &self.key
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn import_url(&self) -> Result<String> {
        self.bucket.import_url(&self.key)
    }

    async fn reader(&self) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .bucket
            .get(&self.key)
            .await
            .with_context(|| format!("error downloading {}", self.key))?;
        Ok(decoded_reader(&self.key, Cursor::new(bytes)))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        if self.bucket.batch_deletes() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(self.key.clone());
            return Ok(());
        }
        self.bucket
            .delete(std::slice::from_ref(&self.key))
            .await
            .with_context(|| format!("error deleting {}", self.key))
    }
}
