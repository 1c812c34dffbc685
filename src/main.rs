//! vizproxy binary: accept one client, start the backend, proxy the session.
//!
//! Usage: vizproxy [OPTIONS] -- <backend command> [args...]
//!
//! The process exits with the backend's exit status (128 + signal when it
//! was killed by a signal).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vizproxy::backend::ProcessTransport;
use vizproxy::config::{
    DEFAULT_EXIT_GRACE, DEFAULT_IDLE_TIMEOUT, DEFAULT_KILL_GRACE, DEFAULT_PROMPT, DEFAULT_STATS_LOG,
    DEFAULT_TERM_GRACE, ShutdownGrace,
};
use vizproxy::protocol::{DEFAULT_BACKEND_CAPACITY, DEFAULT_CLIENT_CAPACITY, ImageFormat};
use vizproxy::{ChildProcess, ClientEndpoint, ClientListener, Proxy, ProxyConfig, SessionEnd, SessionRecord};

#[derive(Debug, Parser)]
#[command(name = "vizproxy", version, about = "Render proxy for a script-driven visualization backend")]
struct Cli {
    /// Client endpoint: `host:port` or `unix:/path`.
    #[arg(long, default_value = "127.0.0.1:2020")]
    listen: ClientEndpoint,

    /// Backend prompt that completes each directive.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Also require the directive echo after the prompt.
    #[arg(long)]
    echo_check: bool,

    /// Format of idle-time renders (bmp, png, ppm).
    #[arg(long, default_value = "bmp")]
    image_format: ImageFormat,

    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_millis() as u64)]
    idle_timeout_ms: u64,

    /// Give up on a backend response after this long (default: wait forever).
    #[arg(long)]
    response_timeout_ms: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_CLIENT_CAPACITY)]
    client_buffer: usize,

    #[arg(long, default_value_t = DEFAULT_BACKEND_CAPACITY)]
    backend_buffer: usize,

    /// Session record log (one JSON object per line).
    #[arg(long, default_value = DEFAULT_STATS_LOG)]
    stats_log: PathBuf,

    /// Do not write a session record.
    #[arg(long)]
    no_stats: bool,

    /// Copy every directive sent to the backend into this file.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Directory for structure files handed to the backend.
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_EXIT_GRACE.as_millis() as u64)]
    exit_grace_ms: u64,

    #[arg(long, default_value_t = DEFAULT_TERM_GRACE.as_millis() as u64)]
    term_grace_ms: u64,

    #[arg(long, default_value_t = DEFAULT_KILL_GRACE.as_millis() as u64)]
    kill_grace_ms: u64,

    /// Backend command and its arguments.
    #[arg(last = true, required = true)]
    backend: Vec<String>,
}

impl Cli {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::new(self.backend);
        config.listen = self.listen;
        config.prompt = self.prompt;
        config.echo_check = self.echo_check;
        config.image_format = self.image_format;
        config.idle_timeout = Duration::from_millis(self.idle_timeout_ms);
        config.response_timeout = self.response_timeout_ms.map(Duration::from_millis);
        config.client_buffer_size = self.client_buffer;
        config.backend_buffer_size = self.backend_buffer;
        config.stats_log = (!self.no_stats).then_some(self.stats_log);
        config.record_path = self.record;
        if let Some(dir) = self.scratch_dir {
            config.scratch_dir = dir;
        }
        config.shutdown = ShutdownGrace {
            exit: Duration::from_millis(self.exit_grace_ms),
            term: Duration::from_millis(self.term_grace_ms),
            kill: Duration::from_millis(self.kill_grace_ms),
        };
        config
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Cli::parse().into_config();
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("can't start runtime")?;
    let code = runtime.block_on(serve(config))?;

    std::process::exit(code);
}

/// Run one session and return the process exit code.
async fn serve(config: ProxyConfig) -> anyhow::Result<i32> {
    let listener = ClientListener::bind(&config.listen)
        .await
        .with_context(|| format!("can't listen on {}", config.listen))?;
    tracing::info!("waiting for client on {}", listener.local_endpoint()?);

    let mut conn = listener.accept().await.context("accept failed")?;
    tracing::info!("client connected from {}", conn.peer);

    let mut backend = ChildProcess::start(&config.backend)?;
    let renderer = backend.program().to_string();

    let mut proxy = Proxy::new(config.clone());
    let result = proxy.run(&mut backend, conn.reader, &mut conn.writer).await;

    let outcome = match &result {
        Ok(SessionEnd::BackendExited(outcome)) => *outcome,
        _ => backend
            .terminate(config.shutdown)
            .await
            .context("can't stop backend")?,
    };
    tracing::info!("backend {} finished: {} after {:?}", renderer, outcome, backend.uptime());

    let mut code = outcome.exit_code();
    if let Err(e) = &result {
        tracing::error!("session ended with error: {}", e);
        if code == 0 {
            code = 1;
        }
    }

    if let Some(path) = &config.stats_log {
        SessionRecord::from_session(proxy.session(), &renderer, code).write_best_effort(path);
    }
    Ok(code)
}
