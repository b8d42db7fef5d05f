// ABOUTME: Forward-only row streams ordered by primary key
// ABOUTME: RowIterator pages through a shard with keyset pagination; RowBuffer replays fetched rows

pub mod query;

use crate::dbconn::{Conn, Row};
use crate::dbtable::{Side, TableShard};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;

/// A lazy, forward-only, non-restartable sequence of rows in ascending key order.
///
/// `has_next` may block on a network fetch. When it returns false, `error`
/// tells exhaustion apart from failure.
#[async_trait]
pub trait RowStream: Send {
    /// Make sure a current row is buffered. False on exhaustion or failure.
    async fn has_next(&mut self) -> bool;

    /// Take the current row. Only meaningful after `has_next` returned true.
    fn next(&mut self) -> Option<Row>;

    /// The current row, without advancing.
    fn peek(&self) -> Option<&Row>;

    /// The failure that ended the stream, if any.
    fn error(&self) -> Option<&anyhow::Error>;
}

/// Pages through one shard with `WHERE (pk) > (last seen pk)` queries.
///
/// No retry happens here. A failed fetch closes the iterator and is exposed
/// through `error`.
pub struct RowIterator {
    conn: Arc<dyn Conn>,
    shard: TableShard,
    types: Vec<String>,
    batch_size: usize,
    buffer: VecDeque<Row>,
    last_pk: Option<Row>,
    exhausted: bool,
    error: Option<anyhow::Error>,
}

impl RowIterator {
    pub fn new(conn: Arc<dyn Conn>, shard: TableShard, side: Side, batch_size: usize) -> Self {
        let types = shard.table.types_for(side).to_vec();
        Self {
            conn,
            shard,
            types,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            last_pk: None,
            exhausted: false,
            error: None,
        }
    }

    pub fn shard(&self) -> &TableShard {
        &self.shard
    }

    async fn fetch_batch(&mut self) -> anyhow::Result<()> {
        let sql = query::scan_query(
            self.conn.dialect(),
            &self.shard,
            &self.types,
            self.last_pk.as_deref(),
            self.batch_size,
        );
        tracing::trace!(conn = self.conn.id(), sql = %sql, "fetching batch");

        let rows = self.conn.query(&sql).await.with_context(|| {
            format!(
                "error scanning {} on {} (shard {}/{})",
                self.shard.table.name,
                self.conn.id(),
                self.shard.shard_num,
                self.shard.total_shards
            )
        })?;

        if rows.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_pk = Some(self.shard.table.pk_of(last).to_vec());
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

#[async_trait]
impl RowStream for RowIterator {
    async fn has_next(&mut self) -> bool {
        if !self.buffer.is_empty() {
            return true;
        }
        if self.exhausted || self.error.is_some() {
            return false;
        }
        if let Err(e) = self.fetch_batch().await {
            self.error = Some(e);
            self.exhausted = true;
            return false;
        }
        !self.buffer.is_empty()
    }

    fn next(&mut self) -> Option<Row> {
        self.buffer.pop_front()
    }

    fn peek(&self) -> Option<&Row> {
        self.buffer.front()
    }

    fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }
}

/// Rows already in memory, replayed as a stream. Never fails.
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: VecDeque<Row>,
}

impl RowBuffer {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }
}

#[async_trait]
impl RowStream for RowBuffer {
    async fn has_next(&mut self) -> bool {
        !self.rows.is_empty()
    }

    fn next(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    fn peek(&self) -> Option<&Row> {
        self.rows.front()
    }

    fn error(&self) -> Option<&anyhow::Error> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::Datum;
    use crate::dbconn::Dialect;
    use crate::dbtable::testutil::users_table;
    use std::sync::Mutex;

    /// Serves scripted pages and records every query it was sent.
    struct PagedConn {
        pages: Mutex<VecDeque<anyhow::Result<Vec<Row>>>>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Conn for PagedConn {
        fn id(&self) -> &str {
            "source"
        }
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
        async fn query(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
            self.seen.lock().unwrap().push(sql.to_string());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
        async fn execute(&self, _sql: &str) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn clone_conn(&self) -> anyhow::Result<Arc<dyn Conn>> {
            anyhow::bail!("not supported")
        }
    }

    fn row(id: i64) -> Row {
        vec![Datum::Int(id), Datum::Text(format!("user{}", id))]
    }

    #[tokio::test]
    async fn test_pages_with_keyset() {
        let conn = Arc::new(PagedConn {
            pages: Mutex::new(VecDeque::from(vec![
                Ok(vec![row(1), row(2)]),
                Ok(vec![row(3), row(4)]),
                Ok(vec![row(5)]),
            ])),
            seen: Mutex::new(Vec::new()),
        });
        let mut it = RowIterator::new(
            conn.clone(),
            TableShard::whole(users_table()),
            Side::Source,
            2,
        );

        let mut ids = Vec::new();
        while it.has_next().await {
            assert_eq!(it.peek().map(|r| r[0].clone()), Some(Datum::Int(ids.len() as i64 + 1)));
            ids.push(it.next().unwrap()[0].clone());
        }
        assert!(it.error().is_none());
        assert_eq!(ids.len(), 5);

        let seen = conn.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].contains("WHERE"));
        assert!(seen[1].contains("(\"id\") > (2)"));
        assert!(seen[2].contains("(\"id\") > (4)"));
    }

    #[tokio::test]
    async fn test_failure_closes_iterator() {
        let conn = Arc::new(PagedConn {
            pages: Mutex::new(VecDeque::from(vec![
                Ok(vec![row(1), row(2)]),
                Err(anyhow::anyhow!("connection reset")),
            ])),
            seen: Mutex::new(Vec::new()),
        });
        let mut it = RowIterator::new(conn, TableShard::whole(users_table()), Side::Source, 2);

        let mut count = 0;
        while it.has_next().await {
            it.next();
            count += 1;
        }
        assert_eq!(count, 2);
        let err = it.error().expect("iterator should report the failure");
        assert!(format!("{:#}", err).contains("connection reset"));
        assert!(!it.has_next().await);
    }

    #[tokio::test]
    async fn test_row_buffer_replays_rows() {
        let mut buf = RowBuffer::new(vec![row(7), row(8)]);
        assert!(buf.has_next().await);
        assert_eq!(buf.peek(), Some(&row(7)));
        assert_eq!(buf.next(), Some(row(7)));
        assert_eq!(buf.next(), Some(row(8)));
        assert!(!buf.has_next().await);
        assert!(buf.error().is_none());
    }
}
