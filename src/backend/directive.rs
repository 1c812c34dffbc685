//! Synchronous directive exchange with the backend.
//!
//! The backend is a line-oriented interpreter: it reads one directive,
//! executes it, and prints a prompt when it is ready for the next one. The
//! [`DirectiveChannel`] writes a directive and then reads backend output
//! until a line with the expected prefix shows up. Exactly one exchange is
//! outstanding at a time.
//!
//! Failures latch: once an exchange fails, [`ProxySession::fault`] is set and
//! every later exchange fails at once without touching the pipes, until an
//! exchange succeeds again.

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::error::{ProxyError, Result};
use crate::protocol::{LineBuffer, LineStatus};
use crate::session::ProxySession;
use crate::transport::BoxedWriter;

/// One unit of backend script text, always newline terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive(String);

impl Directive {
    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Self(text)
    }

    /// Several statements sent as a single line, separated by `;`.
    pub fn compound<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = statements
            .into_iter()
            .map(|s| s.as_ref().trim_end().to_string())
            .collect();
        Self::new(parts.join(";"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Text up to the first embedded newline.
    pub fn first_line(&self) -> &str {
        self.0.split('\n').next().unwrap_or_default()
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end())
    }
}

/// Appends every directive sent to a file, so a session can be replayed.
#[derive(Debug)]
pub struct DirectiveRecorder {
    file: File,
    path: PathBuf,
}

impl DirectiveRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn record(&mut self, directive: &Directive) -> std::io::Result<()> {
        self.file.write_all(directive.as_bytes())
    }
}

/// Request/response channel to the backend.
pub struct DirectiveChannel {
    stdin: BoxedWriter,
    stdout: LineBuffer,
    prompt: String,
    echo_check: bool,
    response_timeout: Option<Duration>,
    recorder: Option<DirectiveRecorder>,
}

impl DirectiveChannel {
    /// Create a channel over the backend's stdin and buffered stdout.
    pub fn new(stdin: BoxedWriter, stdout: LineBuffer, prompt: impl Into<String>) -> Self {
        Self {
            stdin,
            stdout,
            prompt: prompt.into(),
            echo_check: false,
            response_timeout: None,
            recorder: None,
        }
    }

    /// Require the directive echo right after the prompt.
    pub fn with_echo_check(mut self, echo_check: bool) -> Self {
        self.echo_check = echo_check;
        self
    }

    /// Bound each wait for a response line or payload.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_recorder(mut self, recorder: DirectiveRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Prefix of the line that completes `directive`.
    pub fn expected_reply(&self, directive: &Directive) -> String {
        if self.echo_check {
            format!("{}{}", self.prompt, directive.first_line())
        } else {
            self.prompt.clone()
        }
    }

    /// Send a directive and wait for the prompt.
    pub async fn send_directive(&mut self, session: &mut ProxySession, directive: &Directive) -> Result<String> {
        let expected = self.expected_reply(directive);
        self.send(session, directive, &expected).await
    }

    /// Send a directive and wait for a line starting with `prefix`.
    ///
    /// Returns the matching line. Lines before it are skipped.
    pub async fn send(&mut self, session: &mut ProxySession, directive: &Directive, prefix: &str) -> Result<String> {
        check_latch(session)?;

        if let Err(e) = self.write_once(directive).await {
            return Err(latch(session, e));
        }
        self.expect(session, prefix).await
    }

    /// Wait for a line starting with `prefix` without sending anything.
    pub async fn expect(&mut self, session: &mut ProxySession, prefix: &str) -> Result<String> {
        check_latch(session)?;

        let timeout = self.response_timeout;
        let stdout = &mut self.stdout;
        let result = bounded(timeout, wait_for_line(stdout, prefix)).await;
        settle(session, result)
    }

    /// Read exactly `n` payload bytes from the backend.
    pub async fn read_exactly(&mut self, session: &mut ProxySession, n: usize) -> Result<Bytes> {
        check_latch(session)?;

        let timeout = self.response_timeout;
        let result = bounded(timeout, self.stdout.read_exactly(n)).await;
        settle(session, result)
    }

    /// Issue a single write for the whole directive.
    ///
    /// A short write is not retried; the backend sees a truncated directive
    /// and the rest is dropped.
    async fn write_once(&mut self, directive: &Directive) -> Result<()> {
        let bytes = directive.as_bytes();
        tracing::debug!("backend <- {}", directive);

        let written = self.stdin.write(bytes).await?;
        if written < bytes.len() {
            tracing::warn!(
                "short write to backend: {} of {} bytes of \"{}\"",
                written,
                bytes.len(),
                directive
            );
        }
        self.stdin.flush().await?;

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.record(directive) {
                tracing::warn!(
                    "disabling directive recording to {}: {}",
                    recorder.path.display(),
                    e
                );
                self.recorder = None;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DirectiveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveChannel")
            .field("stdout", &self.stdout)
            .field("prompt", &self.prompt)
            .field("echo_check", &self.echo_check)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

async fn wait_for_line(stdout: &mut LineBuffer, prefix: &str) -> Result<String> {
    loop {
        match stdout.next_line().await? {
            LineStatus::Line(line) => {
                let text = String::from_utf8_lossy(&line);
                if text.starts_with(prefix) {
                    return Ok(text.into_owned());
                }
                tracing::trace!("backend: {}", text.trim_end());
            }
            LineStatus::Continue => {}
        }
    }
}

async fn bounded<T>(timeout: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(ProxyError::ResponseTimeout(limit))),
        None => fut.await,
    }
}

fn check_latch(session: &ProxySession) -> Result<()> {
    match session.fault.message() {
        Some(message) => Err(ProxyError::Faulted(message.to_string())),
        None => Ok(()),
    }
}

fn latch(session: &mut ProxySession, error: ProxyError) -> ProxyError {
    tracing::error!("backend exchange failed: {}", error);
    session.fault.set(error.to_string());
    error
}

fn settle<T>(session: &mut ProxySession, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            session.fault.clear();
            Ok(value)
        }
        Err(e) => Err(latch(session, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReadMode;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, duplex};

    fn channel() -> (DirectiveChannel, DuplexStream, DuplexStream) {
        let (stdin, backend_in) = duplex(4096);
        let (stdout, backend_out) = duplex(4096);
        let lines = LineBuffer::new("backend", Box::new(stdout), 1024, ReadMode::Blocking);
        (
            DirectiveChannel::new(Box::new(stdin), lines, "PyMOL>"),
            backend_in,
            backend_out,
        )
    }

    #[test]
    fn test_directive_is_newline_terminated() {
        assert_eq!(Directive::new("reset").as_str(), "reset\n");
        assert_eq!(Directive::new("reset\n").as_str(), "reset\n");
        assert_eq!(
            Directive::compound(["reset", "zoom complete=1"]).as_str(),
            "reset;zoom complete=1\n"
        );
        assert_eq!(Directive::new("a\nb\n").first_line(), "a");
    }

    #[tokio::test]
    async fn test_send_skips_lines_until_prompt() {
        let (mut channel, backend_in, mut backend_out) = channel();
        let mut session = ProxySession::new();

        backend_out
            .write_all(b"noise from the interpreter\nPyMOL>turn x,10\n")
            .await
            .unwrap();
        let line = channel
            .send_directive(&mut session, &Directive::new("turn x,10"))
            .await
            .unwrap();
        assert_eq!(line, "PyMOL>turn x,10\n");

        let mut received = BufReader::new(backend_in).lines();
        assert_eq!(received.next_line().await.unwrap().unwrap(), "turn x,10");
    }

    #[tokio::test]
    async fn test_echo_check_extends_prefix() {
        let (channel, _in, _out) = channel();
        let channel = channel.with_echo_check(true);
        let directive = Directive::new("turn x,1\nturn y,2\n");
        assert_eq!(channel.expected_reply(&directive), "PyMOL>turn x,1");
    }

    #[tokio::test]
    async fn test_eof_latches_and_later_sends_skip_io() {
        let (mut channel, backend_in, backend_out) = channel();
        let mut session = ProxySession::new();
        drop(backend_out);

        let err = channel
            .send_directive(&mut session, &Directive::new("reset"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionClosed("backend")));
        assert!(session.fault.is_set());

        let err = channel
            .send_directive(&mut session, &Directive::new("zoom complete=1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Faulted(_)));

        drop(channel);
        let mut received = BufReader::new(backend_in).lines();
        assert_eq!(received.next_line().await.unwrap().unwrap(), "reset");
        assert_eq!(received.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_success_clears_latch() {
        let (mut channel, _in, mut backend_out) = channel();
        let mut session = ProxySession::new();
        session.fault.set("stale");

        assert!(channel.expect(&mut session, "PyMOL>").await.is_err());

        session.fault.clear();
        backend_out.write_all(b"PyMOL>\n").await.unwrap();
        channel.expect(&mut session, "PyMOL>").await.unwrap();
        assert!(!session.fault.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_latches() {
        let (channel, _in, _out) = channel();
        let mut channel = channel.with_response_timeout(Some(Duration::from_secs(30)));
        let mut session = ProxySession::new();

        let err = channel
            .send_directive(&mut session, &Directive::new("refresh"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ResponseTimeout(_)));
        assert!(session.fault.message().unwrap().contains("30s"));
    }

    #[tokio::test]
    async fn test_recorder_copies_directives() {
        let path = std::env::temp_dir().join(format!("vizproxy-record-{}.py", std::process::id()));
        let (channel, _in, mut backend_out) = channel();
        let mut channel = channel.with_recorder(DirectiveRecorder::create(&path).unwrap());
        let mut session = ProxySession::new();

        backend_out.write_all(b"PyMOL>\nPyMOL>\n").await.unwrap();
        channel.send_directive(&mut session, &Directive::new("reset")).await.unwrap();
        channel.send_directive(&mut session, &Directive::new("frame 2")).await.unwrap();

        let recorded = std::fs::read_to_string(&path).unwrap();
        assert_eq!(recorded, "reset\nframe 2\n");
        let _ = std::fs::remove_file(&path);
    }
}
