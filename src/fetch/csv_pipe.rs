// ABOUTME: Splits a CSV byte stream into size- or row-bounded chunks
// ABOUTME: Re-encodes each record and hands chunks to a lazily created sink with its row count

use super::pipe::PipeWriter;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use tokio::sync::oneshot;

const PROGRESS_INTERVAL: u64 = 100_000;

/// Byte sink for one chunk. `close` must be called for the chunk to be complete.
pub trait ChunkWriter: Write + Send {
    fn close(self: Box<Self>) -> io::Result<()>;
    /// Fail the chunk so its reader sees `msg` instead of a short read.
    fn abort(&self, msg: &str);
}

impl ChunkWriter for PipeWriter {
    fn close(self: Box<Self>) -> io::Result<()> {
        PipeWriter::close(&self);
        Ok(())
    }

    fn abort(&self, msg: &str) {
        self.close_with_error(msg);
    }
}

impl ChunkWriter for GzEncoder<PipeWriter> {
    fn close(self: Box<Self>) -> io::Result<()> {
        let inner = (*self).finish()?;
        inner.close();
        Ok(())
    }

    fn abort(&self, msg: &str) {
        self.get_ref().close_with_error(msg);
    }
}

/// Where a chunk goes, plus the channel that receives its final row count.
pub struct ChunkSink {
    pub writer: Box<dyn ChunkWriter>,
    pub rows: oneshot::Sender<usize>,
}

struct OpenChunk {
    csv: csv::Writer<Box<dyn ChunkWriter>>,
    rows: oneshot::Sender<usize>,
}

/// Reads CSV records and rewrites them into chunks.
///
/// A chunk is flushed when its accumulated size exceeds `flush_size` (each
/// field counts its length plus one) or, when `flush_rows` is non-zero, once
/// it holds `flush_rows` records. Records are never split, so quoted fields
/// containing newlines stay intact.
pub struct CsvPipe<R, F> {
    input: R,
    flush_size: usize,
    flush_rows: usize,
    new_sink: F,
    label: String,
}

impl<R, F> CsvPipe<R, F>
where
    R: Read,
    F: FnMut() -> io::Result<ChunkSink>,
{
    pub fn new(input: R, flush_size: usize, flush_rows: usize, label: &str, new_sink: F) -> Self {
        Self {
            input,
            flush_size,
            flush_rows,
            new_sink,
            label: label.to_string(),
        }
    }

    /// Consume the input to EOF. Returns the total number of records.
    pub fn run(mut self) -> Result<u64> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(&mut self.input);
        let mut record = csv::ByteRecord::new();
        let mut open: Option<OpenChunk> = None;
        let mut curr_rows = 0usize;
        let mut curr_size = 0usize;
        let mut total_rows = 0u64;

        loop {
            match reader.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    let err = anyhow::Error::new(e).context("error reading csv input");
                    abort(open.take(), &err);
                    return Err(err);
                }
            }

            if open.is_none() {
                let sink = match (self.new_sink)() {
                    Ok(sink) => sink,
                    Err(e) => return Err(anyhow::Error::new(e).context("error creating chunk")),
                };
                open = Some(OpenChunk {
                    csv: csv::WriterBuilder::new()
                        .has_headers(false)
                        .flexible(true)
                        .from_writer(sink.writer),
                    rows: sink.rows,
                });
            }

            curr_rows += 1;
            total_rows += 1;
            curr_size += record.iter().map(|f| f.len() + 1).sum::<usize>();
            if total_rows % PROGRESS_INTERVAL == 0 {
                tracing::info!(table = %self.label, rows = total_rows, "read rows");
            }

            if let Some(chunk) = open.as_mut() {
                if let Err(e) = chunk.csv.write_byte_record(&record) {
                    let err = anyhow::Error::new(e).context("error writing csv record");
                    abort(open.take(), &err);
                    return Err(err);
                }
            }

            let over_rows = self.flush_rows > 0 && curr_rows >= self.flush_rows;
            if curr_size > self.flush_size || over_rows {
                if let Some(chunk) = open.take() {
                    flush(chunk, curr_rows)?;
                }
                curr_rows = 0;
                curr_size = 0;
            }
        }

        if let Some(chunk) = open.take() {
            flush(chunk, curr_rows)?;
        }
        tracing::debug!(table = %self.label, rows = total_rows, "csv input exhausted");
        Ok(total_rows)
    }
}

fn flush(chunk: OpenChunk, rows: usize) -> Result<()> {
    let writer = chunk
        .csv
        .into_inner()
        .map_err(|e| anyhow::anyhow!("error flushing chunk: {}", e.error()))?;
    writer.close().context("error closing chunk")?;
    // The receiver is gone only when the store already failed; that error is reported there.
    let _ = chunk.rows.send(rows);
    Ok(())
}

fn abort(chunk: Option<OpenChunk>, err: &anyhow::Error) {
    if let Some(chunk) = chunk {
        // Fail the sink before the csv writer drops and flushes into it.
        chunk.csv.get_ref().abort(&format!("{:#}", err));
    }
}
