// ABOUTME: Store that streams chunks straight into the target with COPY
// ABOUTME: Nothing is staged, so there are no resources to import, list or clean up

use super::{BlobStore, ChunkUpload, Resource, TestingKnobs};
use crate::dbconn::{require_postgres, Conn};
use crate::dbtable::VerifiedTable;
use crate::fetch::copy::{copy_from_reader, copy_from_sql};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Target sessions handed out one at a time and returned after a clean COPY.
///
/// Each shard writer copies its chunks one after another, so the pool never
/// holds more sessions than there are shards exporting at once.
struct SessionPool {
    target: Arc<dyn Conn>,
    idle: Mutex<Vec<Arc<dyn Conn>>>,
}

impl SessionPool {
    fn new(target: Arc<dyn Conn>) -> Self {
        Self {
            target,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> Result<Arc<dyn Conn>> {
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match reused {
            Some(conn) => Ok(conn),
            None => self
                .target
                .clone_conn()
                .await
                .context("error connecting to target for direct copy"),
        }
    }

    /// Only sessions whose last COPY succeeded come back; failed ones are dropped.
    fn checkin(&self, conn: Arc<dyn Conn>) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(conn);
    }
}

pub struct DirectCopyStore {
    sessions: SessionPool,
}

impl DirectCopyStore {
    pub fn new(target: Arc<dyn Conn>) -> Self {
        Self {
            sessions: SessionPool::new(target),
        }
    }
}

#[async_trait]
impl BlobStore for DirectCopyStore {
    async fn create_from_reader(
        &self,
        upload: ChunkUpload,
        knobs: &TestingKnobs,
    ) -> Result<Option<Arc<dyn Resource>>> {
        let ChunkUpload {
            reader,
            table,
            index,
            rows,
            ..
        } = upload;
        // Row counts are not tracked here; the chunker tolerates a dropped receiver.
        drop(rows);

        knobs.check_before_read()?;

        let conn = self.sessions.checkout().await?;
        let client = require_postgres(conn.as_ref())?.client();

        tracing::debug!(table = %table.name, batch = index, "csv batch starting");
        copy_from_reader(client, &copy_from_sql(&table, false), Box::new(reader))
            .await
            .with_context(|| format!("error copying batch {} into {}", index, table.name))?;
        self.sessions.checkin(conn);
        knobs.check_after_read()?;
        tracing::debug!(table = %table.name, batch = index, "csv batch complete");
        Ok(None)
    }

    fn can_be_target(&self) -> bool {
        false
    }

    fn default_flush_batch_size(&self) -> usize {
        1024 * 1024
    }

    fn telemetry_name(&self) -> &'static str {
        "copy_direct"
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn list_from_continuation_point(
        &self,
        _table: &VerifiedTable,
        _file_name: &str,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        Ok(Vec::new())
    }
}
