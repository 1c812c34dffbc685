//! Event loop connecting one client to one rendering backend.
//!
//! The [`Proxy`] owns the session state and runs a single cooperative loop:
//! 1. Wait for backend exit, backend stderr, client writability (only while
//!    images are queued), client input, or the idle timer (only while an
//!    update is pending)
//! 2. Translate and execute complete client commands
//! 3. Flush coalesced view changes
//! 4. Render when idle or forced, and queue the image
//! 5. Deliver queued bytes without blocking
//!
//! Backend exchanges are awaited inline; the loop makes no progress while
//! the backend is working.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::backend::{
    DirectiveChannel, DirectiveRecorder, ExitOutcome, ProcessTransport, RenderRequest, render_into,
};
use crate::coalesce;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::handler::{CommandContext, CommandRegistry};
use crate::protocol::{
    CommandAssembler, CommandRecord, LineBuffer, LineStatus, ReadMode, error_line,
};
use crate::queue::{DrainStatus, ImageQueue};
use crate::session::{PendingFlags, ProxySession};
use crate::transport::{BoxedReader, ClientSink};

/// Label of the client stream in errors and logs.
pub const CLIENT_LABEL: &str = "client";

/// Label of the backend stdout stream in errors and logs.
pub const BACKEND_LABEL: &str = "backend";

/// How long a failed session waits to learn whether the backend died.
pub const EXIT_PROBE: Duration = Duration::from_millis(100);

/// How long a closed client is still fed queued images.
pub const CLIENT_LINGER: Duration = Duration::from_secs(5);

const STDERR_CHUNK: usize = 4096;

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its side of the connection.
    ClientClosed,
    /// The backend exited while the session was running.
    BackendExited(ExitOutcome),
}

/// One client session against one backend.
pub struct Proxy {
    config: ProxyConfig,
    registry: CommandRegistry,
    session: ProxySession,
    queue: ImageQueue,
}

impl Proxy {
    /// Proxy with every built-in verb.
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_registry(config, CommandRegistry::with_defaults())
    }

    pub fn with_registry(config: ProxyConfig, registry: CommandRegistry) -> Self {
        Self {
            config,
            registry,
            session: ProxySession::new(),
            queue: ImageQueue::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn session(&self) -> &ProxySession {
        &self.session
    }

    /// Bytes still waiting for the client.
    pub fn queue(&self) -> &ImageQueue {
        &self.queue
    }

    /// Run the session until the client leaves, the backend exits, or a
    /// fatal error occurs.
    ///
    /// # Errors
    ///
    /// Any stream fault on either side, a latched backend fault, or an
    /// error from the backend transport.
    pub async fn run<T, S>(&mut self, transport: &mut T, client: BoxedReader, sink: &mut S) -> Result<SessionEnd>
    where
        T: ProcessTransport,
        S: ClientSink,
    {
        let result = self.serve(transport, client, sink).await;

        let end = match result {
            Ok(end) => end,
            Err(ProxyError::ConnectionClosed(label)) if label == CLIENT_LABEL => {
                self.linger(sink).await;
                SessionEnd::ClientClosed
            }
            Err(e) => match tokio::time::timeout(EXIT_PROBE, transport.wait_exit()).await {
                Ok(Ok(outcome)) => {
                    tracing::error!("{}: {}", ProxyError::ChildDied(outcome), e);
                    SessionEnd::BackendExited(outcome)
                }
                _ => {
                    tracing::error!("session failed: {}", e);
                    return Err(e);
                }
            },
        };
        tracing::info!(
            "session ended ({:?}): {} commands, {} frames, {} bytes",
            end,
            self.session.stats.commands,
            self.session.stats.frames_sent,
            self.session.stats.bytes_sent
        );
        Ok(end)
    }

    async fn serve<T, S>(&mut self, transport: &mut T, client: BoxedReader, sink: &mut S) -> Result<SessionEnd>
    where
        T: ProcessTransport,
        S: ClientSink,
    {
        let io = transport.take_io()?;
        let mut channel = self.open_channel(io.stdin, io.stdout);
        let mut stderr = io.stderr;
        let mut stderr_buf = vec![0u8; STDERR_CHUNK];

        let mut client = LineBuffer::new(
            CLIENT_LABEL,
            client,
            self.config.client_buffer_size,
            ReadMode::NonBlocking,
        );
        let mut assembler = CommandAssembler::new();

        if let Some(banner) = &self.config.banner {
            self.queue.push(Bytes::from(banner.clone()));
        }
        tracing::debug!("session started on backend pid {:?}", transport.pid());

        loop {
            let mut idle = false;
            let ready = if self.session.wants_render(false) {
                self.queue.is_empty()
            } else {
                client.has_line()
            };

            if !ready {
                let draining = !self.queue.is_empty();
                let update_pending = self.session.flags.contains(PendingFlags::UPDATE_PENDING);
                let reading = !client.has_line();

                tokio::select! {
                    biased;

                    outcome = transport.wait_exit() => {
                        let outcome = outcome?;
                        tracing::error!("{}", ProxyError::ChildDied(outcome));
                        return Ok(SessionEnd::BackendExited(outcome));
                    }

                    read = stderr.read(&mut stderr_buf) => {
                        let n = read?;
                        if n == 0 {
                            return Err(ProxyError::ConnectionClosed("backend stderr"));
                        }
                        tracing::debug!(
                            "backend stderr: {}",
                            String::from_utf8_lossy(&stderr_buf[..n]).trim_end()
                        );
                    }

                    ready = sink.writable(), if draining => {
                        ready?;
                    }

                    filled = client.fill_ready(), if reading => {
                        filled?;
                    }

                    _ = tokio::time::sleep(self.config.idle_timeout), if update_pending => {
                        idle = true;
                    }
                }
            }

            self.read_commands(&mut client, &mut assembler, &mut channel)
                .await?;

            coalesce::flush(&mut self.session, &mut channel).await?;

            if self.queue.is_empty() && self.session.wants_render(idle) {
                let request = RenderRequest::current(self.config.image_format);
                render_into(&mut self.session, &mut channel, &mut self.queue, &request).await?;
                self.session.rendered();
            }

            if !self.queue.is_empty() {
                if let DrainStatus::Blocked = self.queue.drain_to(sink)? {
                    tracing::trace!("client blocked with {} bytes queued", self.queue.pending_bytes());
                }
            }

            if let Some(message) = self.session.fault.message() {
                return Err(ProxyError::Faulted(message.to_string()));
            }
        }
    }

    /// Deliver what is still queued to a client that stopped sending.
    ///
    /// Gives up after [`CLIENT_LINGER`] or at the first write error.
    async fn linger<S: ClientSink>(&mut self, sink: &mut S) {
        let queue = &mut self.queue;
        let deliver = async {
            loop {
                match queue.drain_to(&mut *sink)? {
                    DrainStatus::Drained => return Ok::<(), ProxyError>(()),
                    DrainStatus::Blocked => sink.writable().await?,
                }
            }
        };
        let result = match tokio::time::timeout(CLIENT_LINGER, deliver).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Protocol("client stopped reading".into())),
        };
        if let Err(e) = result {
            tracing::debug!("dropping {} undelivered bytes: {}", self.queue.pending_bytes(), e);
        }
    }

    fn open_channel(&self, stdin: crate::transport::BoxedWriter, stdout: BoxedReader) -> DirectiveChannel {
        let stdout = LineBuffer::new(
            BACKEND_LABEL,
            stdout,
            self.config.backend_buffer_size,
            ReadMode::Blocking,
        );
        let mut channel = DirectiveChannel::new(stdin, stdout, self.config.prompt.clone())
            .with_echo_check(self.config.echo_check)
            .with_response_timeout(self.config.response_timeout);

        if let Some(path) = &self.config.record_path {
            match DirectiveRecorder::create(path) {
                Ok(recorder) => channel = channel.with_recorder(recorder),
                Err(e) => tracing::warn!("can't record directives to {}: {}", path.display(), e),
            }
        }
        channel
    }

    /// Execute every complete command the client has sent so far.
    ///
    /// Stops early once a command forces an update, so the image for it is
    /// rendered before later commands run.
    async fn read_commands(
        &mut self,
        client: &mut LineBuffer,
        assembler: &mut CommandAssembler,
        channel: &mut DirectiveChannel,
    ) -> Result<()> {
        while !self.session.wants_render(false) {
            let line = match client.next_line().await? {
                LineStatus::Line(line) => line,
                LineStatus::Continue => break,
            };
            match assembler.push_line(&line) {
                Ok(Some(record)) => self.execute(record, channel, client).await?,
                Ok(None) => {}
                Err(e) if e.is_command_local() => self.reject(&e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Translate and run one command.
    ///
    /// Errors that only concern the command are reported to the client;
    /// anything else is returned.
    async fn execute(
        &mut self,
        record: CommandRecord,
        channel: &mut DirectiveChannel,
        client: &mut LineBuffer,
    ) -> Result<()> {
        tracing::debug!("client -> {}", record);
        let started = Instant::now();

        let result = match self.registry.translate(&record, &mut self.session) {
            Ok(translation) => {
                let mut ctx = CommandContext {
                    session: &mut self.session,
                    channel,
                    client,
                    queue: &mut self.queue,
                    scratch_dir: &self.config.scratch_dir,
                };
                ctx.apply(translation).await
            }
            Err(e) => Err(e),
        };
        self.session.stats.record_command(started.elapsed());

        match result {
            Err(e) if e.is_command_local() => {
                self.reject(&e);
                Ok(())
            }
            other => other,
        }
    }

    /// Report a command error to the client.
    fn reject(&mut self, error: &ProxyError) {
        tracing::warn!("{}", error);
        self.queue.push(error_line(&error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Reply};
    use crate::protocol::ImageFormat;
    use std::io;
    use tokio::io::{AsyncWriteExt, duplex};

    #[derive(Default)]
    struct OpenSink {
        received: Vec<u8>,
    }

    impl ClientSink for OpenSink {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.received.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn writable(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::new(vec!["pymol".into()]);
        config.banner = Some("hello\n".into());
        config.stats_log = None;
        config
    }

    fn client_with(input: &'static [u8]) -> BoxedReader {
        let (mut writer, reader) = duplex(4096);
        tokio::spawn(async move {
            let _ = writer.write_all(input).await;
        });
        Box::new(reader)
    }

    #[tokio::test]
    async fn test_banner_and_unknown_command() {
        let mut backend = MemoryBackend::spawn(|_| vec![Reply::prompt("PyMOL>")]);
        let mut sink = OpenSink::default();
        let mut proxy = Proxy::new(config());

        let end = proxy
            .run(&mut backend, client_with(b"spin 3\n"), &mut sink)
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::ClientClosed);
        assert_eq!(sink.received, b"hello\nnv>error unknown command \"spin\"\n");
        assert!(backend.directives().is_empty());
        assert_eq!(proxy.session().stats.commands, 1);
    }

    #[tokio::test]
    async fn test_push_renders_before_next_command() {
        let mut backend = MemoryBackend::prompting("PyMOL>", ImageFormat::Bmp, Bytes::from_static(b"BM"));
        let mut sink = OpenSink::default();
        let mut proxy = Proxy::new(config());

        proxy
            .run(&mut backend, client_with(b"reset -push\nframe 2 -defer\n"), &mut sink)
            .await
            .unwrap();

        assert_eq!(backend.directives(), vec!["reset;zoom complete=1", "bmp -", "frame 2"]);
        assert_eq!(sink.received, b"hello\nnv>image 2 0 1 0\nBM");
    }

    #[tokio::test]
    async fn test_backend_exit_ends_session() {
        let mut backend = MemoryBackend::spawn(|line| {
            if line == "quit" {
                vec![Reply::Exit(ExitOutcome::exited(3))]
            } else {
                vec![Reply::prompt("PyMOL>")]
            }
        });
        let mut sink = OpenSink::default();
        let mut proxy = Proxy::new(config());

        let (mut writer, reader) = duplex(4096);
        writer.write_all(b"raw quit\n").await.unwrap();

        let end = proxy.run(&mut backend, Box::new(reader), &mut sink).await.unwrap();
        assert_eq!(end, SessionEnd::BackendExited(ExitOutcome::exited(3)));
        drop(writer);
    }
}
