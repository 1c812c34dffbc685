//! Fixed-capacity line buffer for the client and backend streams.
//!
//! Both streams deliver newline-terminated text, and the backend stream also
//! carries raw image payloads of a known length. A `LineBuffer` owns one
//! reader and one fixed byte area:
//!
//! ```text
//!  0          mark               fill              capacity
//!  |  consumed  |  unconsumed     |  free           |
//! ```
//!
//! Bytes in `[mark, fill)` are unconsumed. A line is only handed out once its
//! terminator is inside that range, so partial reads never surface to callers.
//!
//! Two read modes exist. The backend buffer is `Blocking`: a fill waits until
//! the backend produces data. The client buffer is `NonBlocking`: a fill that
//! would wait returns `FillStatus::Short` with nothing read.

use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{ProxyError, Result};
use crate::transport::BoxedReader;

/// Default capacity of the client input buffer (64KB).
pub const DEFAULT_CLIENT_CAPACITY: usize = 1 << 16;

/// Default capacity of the backend output buffer (256KB).
pub const DEFAULT_BACKEND_CAPACITY: usize = 1 << 18;

/// How `fill()` behaves when no data is available yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait for the next read to complete.
    Blocking,
    /// Return `FillStatus::Short` instead of waiting.
    NonBlocking,
}

/// Outcome of a single fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// The read filled all free space.
    Full,
    /// The read returned less than requested; more may follow later.
    Short,
}

/// Outcome of `next_line()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete line, terminator included.
    Line(Bytes),
    /// No complete line yet and the last read came up short.
    Continue,
}

/// Line-oriented reader over one stream.
pub struct LineBuffer {
    /// Stream name used in errors and logs.
    label: &'static str,
    reader: BoxedReader,
    bytes: Box<[u8]>,
    mark: usize,
    fill: usize,
    mode: ReadMode,
}

impl LineBuffer {
    /// Create a buffer of `capacity` bytes over `reader`.
    pub fn new(label: &'static str, reader: BoxedReader, capacity: usize, mode: ReadMode) -> Self {
        Self {
            label,
            reader,
            bytes: vec![0u8; capacity.max(2)].into_boxed_slice(),
            mark: 0,
            fill: 0,
            mode,
        }
    }

    /// Stream name.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Number of unconsumed bytes.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.fill - self.mark
    }

    /// Whether a complete line is already buffered.
    pub fn has_line(&self) -> bool {
        self.bytes[self.mark..self.fill].contains(&b'\n')
    }

    /// Read once from the stream into the free space.
    ///
    /// In `NonBlocking` mode this never waits: a read that is not ready
    /// reports `Short`. End of file and read failures are errors.
    pub async fn fill(&mut self) -> Result<FillStatus> {
        match self.mode {
            ReadMode::Blocking => self.fill_ready().await,
            ReadMode::NonBlocking => self.try_fill(),
        }
    }

    /// Wait until one read completes, whatever the read mode.
    ///
    /// This is cancel-safe: if the future is dropped before the read
    /// completes, nothing has been consumed from the stream.
    pub async fn fill_ready(&mut self) -> Result<FillStatus> {
        self.compact();
        let want = self.free()?;
        let start = self.fill;
        let n = self.reader.read(&mut self.bytes[start..start + want]).await?;
        self.record(n, want)
    }

    fn try_fill(&mut self) -> Result<FillStatus> {
        self.compact();
        let want = self.free()?;
        let start = self.fill;

        let mut cx = Context::from_waker(Waker::noop());
        let mut buf = ReadBuf::new(&mut self.bytes[start..start + want]);
        match Pin::new(&mut self.reader).poll_read(&mut cx, &mut buf) {
            Poll::Pending => Ok(FillStatus::Short),
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len();
                self.record(n, want)
            }
            Poll::Ready(Err(e)) => Err(e.into()),
        }
    }

    /// Return the next complete line, reading at most once per call.
    ///
    /// Returns `Continue` when no line is buffered and the read made in this
    /// call came up short.
    pub async fn next_line(&mut self) -> Result<LineStatus> {
        let mut last = FillStatus::Full;
        loop {
            if let Some(line) = self.take_line() {
                return Ok(LineStatus::Line(line));
            }
            if last == FillStatus::Short {
                return Ok(LineStatus::Continue);
            }
            last = self.fill().await?;
        }
    }

    /// Pop a complete line from the buffered bytes without reading.
    pub fn take_line(&mut self) -> Option<Bytes> {
        let pending = &self.bytes[self.mark..self.fill];
        let pos = pending.iter().position(|&b| b == b'\n')?;
        let line = Bytes::copy_from_slice(&pending[..=pos]);
        self.mark += pos + 1;
        Some(line)
    }

    /// Read exactly `n` bytes, buffered bytes first.
    ///
    /// Never returns a partial result; the only failure is a read error or
    /// end of file before `n` bytes arrived.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(n);
        loop {
            let take = self.buffered().min(n - out.len());
            out.extend_from_slice(&self.bytes[self.mark..self.mark + take]);
            self.mark += take;

            if out.len() == n {
                return Ok(out.freeze());
            }
            self.fill_ready().await?;
        }
    }

    /// Move the unconsumed tail to the front of the buffer.
    fn compact(&mut self) {
        if self.mark >= self.fill {
            self.mark = 0;
            self.fill = 0;
        } else if self.mark > 0 {
            self.bytes.copy_within(self.mark..self.fill, 0);
            self.fill -= self.mark;
            self.mark = 0;
        }
    }

    /// Free space after compaction. One byte is kept in reserve.
    fn free(&self) -> Result<usize> {
        let free = self.bytes.len() - 1 - self.fill;
        if free == 0 {
            return Err(ProxyError::Protocol(format!(
                "{} line exceeds {} byte buffer",
                self.label,
                self.bytes.len() - 1
            )));
        }
        Ok(free)
    }

    fn record(&mut self, n: usize, want: usize) -> Result<FillStatus> {
        if n == 0 {
            return Err(ProxyError::ConnectionClosed(self.label));
        }
        self.fill += n;
        Ok(if n < want {
            FillStatus::Short
        } else {
            FillStatus::Full
        })
    }
}

impl std::fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineBuffer")
            .field("label", &self.label)
            .field("capacity", &self.bytes.len())
            .field("mark", &self.mark)
            .field("fill", &self.fill)
            .field("mode", &self.mode)
            .finish()
    }
}
