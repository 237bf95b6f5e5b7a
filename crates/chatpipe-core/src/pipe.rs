//! Virtual byte-pipe: an in-memory stand-in for a TCP socket.
//!
//! The client peer hands the proxy front-end a TCP-like read surface for
//! bytes that actually arrive as chat messages. A pipe is single-producer,
//! single-consumer: the poll dispatcher writes decoded payloads into one
//! end, the per-connection pump reads from the other.
//!
//! # Contract
//!
//! - `write` appends bytes, suspending while the buffer sits at or above
//!   the high-watermark. Backpressure therefore reaches the dispatcher and,
//!   through it, the poll loop when the reading side lags.
//! - `read(n)` returns up to `n` bytes as soon as any are available. It
//!   returns an empty chunk once the pipe is closed and drained, or after
//!   the read-idle timeout expires with nothing buffered. Callers treat an
//!   empty chunk as end-of-stream.
//! - `close` marks the pipe closed: later writes fail, later reads drain
//!   the buffer and then return empty.
//!
//! End-of-stream is normally driven by the peer's `CLOSED` frame closing
//! the pipe; the idle timeout is a bound on how long a read waits on a
//! silent transport before giving up.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;

/// Buffered bytes above which `write` suspends until the reader drains.
pub const DEFAULT_HIGH_WATERMARK: usize = 1024 * 1024;

/// How long `read` waits for data before returning an empty chunk.
pub const DEFAULT_READ_IDLE: Duration = Duration::from_secs(30);

/// Writing to a pipe whose other end was closed.
#[derive(Debug, Error)]
#[error("pipe is closed")]
pub struct PipeClosed;

struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    high_watermark: usize,
    read_idle: Duration,
}

struct State {
    buf: BytesMut,
    closed: bool,
}

impl Shared {
    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

/// Creates a connected pipe pair.
pub fn pipe(high_watermark: usize, read_idle: Duration) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: BytesMut::new(),
            closed: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
        high_watermark,
        read_idle,
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

/// The producing end of a pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Appends `data`, waiting for the reader to drain the buffer below
    /// the high-watermark first if necessary.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), PipeClosed> {
        loop {
            let wait = {
                let mut state = self.shared.state.lock().map_err(|_| PipeClosed)?;
                if state.closed {
                    return Err(PipeClosed);
                }
                if state.buf.len() < self.shared.high_watermark {
                    state.buf.extend_from_slice(data);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
                self.shared.writable.notified()
            };
            wait.await;
        }
    }

    /// Closes the pipe. The reader drains what is buffered, then sees
    /// end-of-stream.
    pub fn close(&mut self) {
        self.shared.close();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

/// The consuming end of a pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Reads up to `max` bytes.
    ///
    /// Returns an empty chunk at end-of-stream: the pipe is closed and
    /// drained, or nothing arrived within the read-idle timeout.
    pub async fn read(&mut self, max: usize) -> Bytes {
        loop {
            let wait = {
                let Ok(mut state) = self.shared.state.lock() else {
                    return Bytes::new();
                };
                if !state.buf.is_empty() {
                    let n = max.min(state.buf.len());
                    let chunk = state.buf.split_to(n).freeze();
                    drop(state);
                    self.shared.writable.notify_one();
                    return chunk;
                }
                if state.closed {
                    return Bytes::new();
                }
                self.shared.readable.notified()
            };
            if tokio::time::timeout(self.shared.read_idle, wait).await.is_err() {
                return Bytes::new();
            }
        }
    }

    /// Closes the pipe from the reading side, unblocking a suspended
    /// writer.
    pub fn close(&mut self) {
        self.shared.close();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
