// ABOUTME: In-process byte pipe with close-with-error propagation
// ABOUTME: Unbounded for per-chunk sinks, byte-bounded where a producer must stall on a slow reader

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use thiserror::Error;

/// The cause a pipe was closed with, as seen by the other end.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PipeError(pub String);

impl PipeError {
    fn io(kind: io::ErrorKind, msg: impl Into<String>) -> io::Error {
        io::Error::new(kind, PipeError(msg.into()))
    }
}

/// True when an error only relays a pipe closure caused elsewhere.
pub fn is_pipe_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<PipeError>()
            || cause
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .is_some_and(|inner| inner.is::<PipeError>())
    })
}

#[derive(Default)]
struct State {
    buf: VecDeque<u8>,
    // Writer finished cleanly; readers see EOF once the buffer drains.
    eof: bool,
    // Terminal error; every later read and write fails with it.
    err: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    // Maximum buffered bytes before writers wait; None never waits.
    capacity: Option<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a peer panicked mid-copy; the buffer is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a connected reader/writer pair.
///
/// The buffer grows without bound, so a producer can finish a whole chunk
/// before anyone starts reading it. Readers block on a condition variable
/// until bytes arrive, the writer closes, or either end closes with an error.
pub fn pipe() -> (PipeReader, PipeWriter) {
    new_pipe(None)
}

/// Like [`pipe`], but a write waits while `capacity` bytes are already
/// buffered, so a fast writer can never run more than `capacity` bytes ahead
/// of its reader. Writes may be partial; use `write_all`.
pub fn bounded_pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    new_pipe(Some(capacity.max(1)))
}

fn new_pipe(capacity: Option<usize>) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        cond: Condvar::new(),
        capacity,
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// A cloneable handle that can terminate a pipe from anywhere.
#[derive(Clone)]
pub struct PipeHandle {
    shared: Arc<Shared>,
}

impl PipeHandle {
    /// Fail the pipe. The first error wins; later calls are ignored.
    pub fn close_with_error(&self, msg: impl Into<String>) {
        let mut state = self.shared.lock();
        if state.err.is_none() {
            state.err = Some(msg.into());
        }
        self.shared.cond.notify_all();
    }

    /// The error the pipe was closed with, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.lock().err.clone()
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn close_with_error(&self, msg: impl Into<String>) {
        self.handle().close_with_error(msg);
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.lock();
        loop {
            if let Some(err) = &state.err {
                return Err(PipeError::io(io::ErrorKind::Other, err.clone()));
            }
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for (dst, src) in out.iter_mut().zip(state.buf.drain(..n)) {
                    *dst = src;
                }
                if self.shared.capacity.is_some() {
                    self.shared.cond.notify_all();
                }
                return Ok(n);
            }
            if state.eof {
                return Ok(0);
            }
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.err.is_none() && !state.eof {
            state.err = Some("pipe reader closed".to_string());
        }
        self.shared.cond.notify_all();
    }
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Signal EOF to the reader once buffered bytes are consumed.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.eof = true;
        self.shared.cond.notify_all();
    }

    pub fn close_with_error(&self, msg: impl Into<String>) {
        self.handle().close_with_error(msg);
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.lock();
        loop {
            if let Some(err) = &state.err {
                return Err(PipeError::io(io::ErrorKind::Other, err.clone()));
            }
            if state.eof {
                return Err(PipeError::io(io::ErrorKind::BrokenPipe, "write to closed pipe"));
            }
            let room = match self.shared.capacity {
                None => data.len(),
                Some(cap) => cap.saturating_sub(state.buf.len()).min(data.len()),
            };
            if room > 0 {
                state.buf.extend(&data[..room]);
                self.shared.cond.notify_all();
                return Ok(room);
            }
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_never_blocks_without_reader() {
        let (mut r, mut w) = pipe();
        let payload = vec![7u8; 4 * 1024 * 1024];
        w.write_all(&payload).unwrap();
        w.close();

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), payload.len());
    }

    #[test]
    fn test_reader_blocks_until_data() {
        let (mut r, mut w) = pipe();
        let handle = thread::spawn(move || {
            let mut out = String::new();
            r.read_to_string(&mut out).unwrap();
            out
        });

        thread::sleep(Duration::from_millis(20));
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        drop(w);

        assert_eq!(handle.join().unwrap(), "hello world");
    }

    #[test]
    fn test_close_with_error_wakes_blocked_reader() {
        let (mut r, w) = pipe();
        let handle = w.handle();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            r.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        handle.close_with_error("producer failed");

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "producer failed");
        drop(w);
    }

    #[test]
    fn test_reader_error_fails_writer() {
        let (r, mut w) = pipe();
        r.close_with_error("upload failed");

        let err = w.write(b"x").unwrap_err();
        assert_eq!(err.to_string(), "upload failed");
    }

    #[test]
    fn test_dropped_reader_breaks_writer() {
        let (r, mut w) = pipe();
        drop(r);
        assert!(w.write(b"x").is_err());
    }

    #[test]
    fn test_relayed_errors_are_recognised() {
        let (mut r, w) = pipe();
        w.close_with_error("upstream failed");
        let mut buf = [0u8; 1];
        let err = anyhow::Error::new(r.read(&mut buf).unwrap_err()).context("error reading");
        assert!(is_pipe_error(&err));
        assert_eq!(err.root_cause().to_string(), "upstream failed");
        assert!(!is_pipe_error(&anyhow::anyhow!("upstream failed")));
    }

    #[test]
    fn test_bounded_writer_waits_for_reader() {
        let (mut r, mut w) = bounded_pipe(8);
        let writer = thread::spawn(move || {
            w.write_all(&[1u8; 32]).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        assert_eq!(r.shared.lock().buf.len(), 8);

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        writer.join().unwrap();
        assert_eq!(out, vec![1u8; 32]);
    }

    #[test]
    fn test_blocked_bounded_writer_fails_when_reader_closes() {
        let (r, mut w) = bounded_pipe(4);
        let writer = thread::spawn(move || w.write_all(b"more than four bytes"));

        thread::sleep(Duration::from_millis(20));
        r.close_with_error("chunker failed");

        let err = writer.join().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "chunker failed");
    }

    #[test]
    fn test_first_error_wins() {
        let (r, w) = pipe();
        w.close_with_error("first");
        r.close_with_error("second");
        assert_eq!(w.handle().error().as_deref(), Some("first"));
    }
}
