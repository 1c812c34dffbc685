//! In-memory backend for tests and dry runs.
//!
//! [`MemoryBackend`] implements [`ProcessTransport`] over `tokio::io::duplex`
//! pipes. A script decides how each received directive is answered, and
//! every directive line is recorded so tests can check exactly what reached
//! the backend.
//!
//! # Example
//!
//! ```ignore
//! use vizproxy::backend::{MemoryBackend, Reply};
//!
//! let backend = MemoryBackend::spawn(|line| {
//!     if line == "bmp -" {
//!         vec![Reply::image(ImageFormat::Bmp, vec![0u8; 16])]
//!     } else {
//!         vec![Reply::prompt("PyMOL>")]
//!     }
//! });
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::process::{BackendIo, ExitOutcome, ProcessTransport};
use crate::config::ShutdownGrace;
use crate::error::{ProxyError, Result};
use crate::protocol::ImageFormat;

/// Pipe capacity of the in-memory streams.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// One scripted reaction to a directive.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write these lines to stdout.
    Lines(Vec<String>),
    /// Announce and write an image, `chunk` bytes per write.
    Image {
        format: ImageFormat,
        payload: Bytes,
        chunk: usize,
    },
    /// Write a line to stderr.
    Stderr(String),
    /// Close stdout; directives are still received and recorded.
    Hangup,
    /// Exit with the given outcome.
    Exit(ExitOutcome),
}

impl Reply {
    pub fn prompt(prompt: &str) -> Self {
        Reply::Lines(vec![prompt.to_string()])
    }

    pub fn image(format: ImageFormat, payload: impl Into<Bytes>) -> Self {
        Reply::Image {
            format,
            payload: payload.into(),
            chunk: usize::MAX,
        }
    }
}

type Script = Box<dyn FnMut(&str) -> Vec<Reply> + Send>;

/// Scripted backend running on a tokio task.
pub struct MemoryBackend {
    io: Option<BackendIo>,
    received: Arc<Mutex<Vec<String>>>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    task: JoinHandle<()>,
}

impl MemoryBackend {
    /// Start a backend that answers each directive line with `script`.
    pub fn spawn<F>(script: F) -> Self
    where
        F: FnMut(&str) -> Vec<Reply> + Send + 'static,
    {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY, script)
    }

    /// Same as [`spawn`](Self::spawn) with a custom pipe capacity.
    pub fn with_capacity<F>(capacity: usize, script: F) -> Self
    where
        F: FnMut(&str) -> Vec<Reply> + Send + 'static,
    {
        let (stdin, backend_in) = duplex(capacity);
        let (stdout, backend_out) = duplex(capacity);
        let (stderr, backend_err) = duplex(capacity);
        let (exit_tx, exit) = watch::channel(None);
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(run_script(
            Box::new(script),
            backend_in,
            backend_out,
            backend_err,
            exit_tx,
            received.clone(),
        ));

        Self {
            io: Some(BackendIo {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            }),
            received,
            exit,
            task,
        }
    }

    /// Backend that prompts after every directive and renders `payload`
    /// for the idle-render directive of `format`.
    pub fn prompting(prompt: &str, format: ImageFormat, payload: Bytes) -> Self {
        let prompt = prompt.to_string();
        let render = format.render_directive();
        let render = render.trim_end().to_string();
        Self::spawn(move |line| {
            if line == render {
                vec![Reply::image(format, payload.clone())]
            } else {
                vec![Reply::prompt(&prompt)]
            }
        })
    }

    /// Every directive line received so far, in order.
    pub fn directives(&self) -> Vec<String> {
        lock(&self.received).clone()
    }
}

impl ProcessTransport for MemoryBackend {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn take_io(&mut self) -> Result<BackendIo> {
        self.io
            .take()
            .ok_or_else(|| ProxyError::Protocol("backend pipes already taken".into()))
    }

    async fn wait_exit(&mut self) -> Result<ExitOutcome> {
        loop {
            if let Some(outcome) = *self.exit.borrow_and_update() {
                return Ok(outcome);
            }
            if self.exit.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn terminate(&mut self, _grace: ShutdownGrace) -> Result<ExitOutcome> {
        self.io = None;
        self.task.abort();
        let exited = *self.exit.borrow();
        Ok(exited.unwrap_or(ExitOutcome::exited(0)))
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(received: &Mutex<Vec<String>>) -> MutexGuard<'_, Vec<String>> {
    received.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_script(
    mut script: Script,
    stdin: DuplexStream,
    stdout: DuplexStream,
    mut stderr: DuplexStream,
    exit: watch::Sender<Option<ExitOutcome>>,
    received: Arc<Mutex<Vec<String>>>,
) {
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = Some(stdout);

    while let Ok(Some(line)) = lines.next_line().await {
        lock(&received).push(line.clone());

        for reply in script(&line) {
            match reply {
                Reply::Lines(texts) => {
                    if let Some(out) = stdout.as_mut() {
                        for text in texts {
                            let _ = out.write_all(format!("{}\n", text).as_bytes()).await;
                        }
                    }
                }
                Reply::Image {
                    format,
                    payload,
                    chunk,
                } => {
                    if let Some(out) = stdout.as_mut() {
                        let _ = write_image(out, format, &payload, chunk).await;
                    }
                }
                Reply::Stderr(text) => {
                    let _ = stderr.write_all(format!("{}\n", text).as_bytes()).await;
                }
                Reply::Hangup => stdout = None,
                Reply::Exit(outcome) => {
                    let _ = exit.send(Some(outcome));
                    return;
                }
            }
        }
    }
}

async fn write_image(
    out: &mut DuplexStream,
    format: ImageFormat,
    payload: &[u8],
    chunk: usize,
) -> std::io::Result<()> {
    let announcement = format!("{}{}\n", format.announcement_prefix(), payload.len());
    out.write_all(announcement.as_bytes()).await?;

    for piece in payload.chunks(chunk.max(1)) {
        out.write_all(piece).await?;
        tokio::task::yield_now().await;
    }

    if let Some(sentinel) = format.sentinel() {
        out.write_all(format!("{}\n", sentinel).as_bytes()).await?;
    }
    Ok(())
}
