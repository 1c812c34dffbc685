//! Transport module - client connection and stream types.
//!
//! Provides:
//! - [`ClientListener`] - accepts the single GUI client over TCP or a Unix socket
//! - [`ClientSink`] - non-blocking write capability used for image delivery
//! - Boxed stream aliases shared by the client and backend sides

mod client;

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub use client::{ClientConnection, ClientEndpoint, ClientListener, ClientWriter};

/// Type-erased reader (client socket half, backend stdout/stderr).
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Type-erased writer (backend stdin).
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Non-blocking output toward the client.
///
/// `try_write` never waits: it returns `ErrorKind::WouldBlock` when the
/// peer cannot take more bytes. `writable` resolves once it probably can.
pub trait ClientSink {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn writable(&self) -> impl Future<Output = io::Result<()>>;
}
