// ABOUTME: Blob store and resource abstractions for staged CSV chunks
// ABOUTME: Cloud buckets, a local directory served over HTTP, or straight into the target

pub mod cloud;
pub mod direct_copy;
pub mod gcs;
pub mod local;
pub mod s3;

use super::pipe::PipeReader;
use crate::dbtable::VerifiedTable;
use anyhow::Result;
use async_trait::async_trait;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::oneshot;

pub use cloud::{Bucket, CloudStore, ListPage, ObjectInfo};
pub use direct_copy::DirectCopyStore;
pub use gcs::GcsBucket;
pub use local::LocalStore;
pub use s3::S3Bucket;

/// Message used by the store-writer failure knobs.
pub const FORCED_WRITE_ERROR: &str = "forced error when writing to blob store";

/// Fault injection for the store writer, used by tests.
#[derive(Debug, Clone, Default)]
pub struct TestingKnobs {
    /// Fail before reading a single byte of the chunk.
    pub fail_before_read: bool,
    /// Fail after the chunk has been fully read.
    pub fail_after_read: bool,
    /// Replaces `FORCED_WRITE_ERROR` as the injected message.
    pub message: Option<String>,
}

impl TestingKnobs {
    fn forced(&self) -> anyhow::Error {
        anyhow::anyhow!(self
            .message
            .clone()
            .unwrap_or_else(|| FORCED_WRITE_ERROR.to_string()))
    }

    pub fn check_before_read(&self) -> Result<()> {
        if self.fail_before_read {
            return Err(self.forced());
        }
        Ok(())
    }

    pub fn check_after_read(&self) -> Result<()> {
        if self.fail_after_read {
            return Err(self.forced());
        }
        Ok(())
    }
}

/// One chunk handed from the CSV chunker to a store.
pub struct ChunkUpload {
    pub reader: PipeReader,
    pub table: VerifiedTable,
    /// 1-based position of the chunk within the table's export.
    pub index: usize,
    pub ext: &'static str,
    /// Resolves to the chunk's row count once all of its bytes are written.
    pub rows: oneshot::Receiver<usize>,
}

/// A staged chunk of CSV data.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Store key, e.g. `public.users/part_00000001.csv`.
    fn key(&self) -> &str;

    fn rows(&self) -> usize;

    /// URL the target's bulk loader can read the chunk from.
    fn import_url(&self) -> Result<String>;

    /// Whether the stored bytes begin with a row-count line to skip on load.
    fn has_header(&self) -> bool {
        false
    }

    /// Decompressed contents, for loading through COPY.
    async fn reader(&self) -> Result<Box<dyn Read + Send>>;

    /// Drop the chunk now or queue it for the store's final cleanup.
    async fn mark_for_cleanup(&self) -> Result<()>;
}

/// Destination for chunks.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Drain one chunk into the store.
    ///
    /// Returns `None` when the bytes went straight into the target and there
    /// is nothing left to load.
    async fn create_from_reader(
        &self,
        upload: ChunkUpload,
        knobs: &TestingKnobs,
    ) -> Result<Option<Arc<dyn Resource>>>;

    /// Whether the target can bulk-load from this store's URLs.
    fn can_be_target(&self) -> bool;

    /// Chunk size used when none is configured.
    fn default_flush_batch_size(&self) -> usize;

    /// Short store label for logs and metrics.
    fn telemetry_name(&self) -> &'static str;

    /// Best-effort removal of everything queued for cleanup.
    async fn cleanup(&self) -> Result<()>;

    /// Resources of `table` from `file_name` onwards, in name order.
    async fn list_from_continuation_point(
        &self,
        table: &VerifiedTable,
        file_name: &str,
    ) -> Result<Vec<Arc<dyn Resource>>>;
}

/// `<prefix>/<schema>.<table>` or just `<schema>.<table>` when there is no prefix.
pub fn table_prefix(base: &str, table: &VerifiedTable) -> String {
    let base = base.trim_matches('/');
    if base.is_empty() {
        table.name.safe_string()
    } else {
        format!("{}/{}", base, table.name.safe_string())
    }
}

/// Extension for a chunk given whether it is gzip compressed.
pub fn chunk_ext(gzip: bool) -> &'static str {
    if gzip {
        "tar.gz"
    } else {
        "csv"
    }
}

pub fn is_gzip_key(key: &str) -> bool {
    key.ends_with(".gz")
}

/// Wrap a reader in a gzip decoder when the key says it is compressed.
pub fn decoded_reader<R: Read + Send + 'static>(key: &str, inner: R) -> Box<dyn Read + Send> {
    if is_gzip_key(key) {
        Box::new(flate2::read::MultiGzDecoder::new(inner))
    } else {
        Box::new(inner)
    }
}
