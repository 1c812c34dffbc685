//! Proxy configuration.
//!
//! Every knob has a `DEFAULT_*` constant and [`ProxyConfig::default`] uses
//! them all. The binary maps its command line onto this struct; tests build
//! it directly.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::protocol::{DEFAULT_BACKEND_CAPACITY, DEFAULT_CLIENT_CAPACITY, ImageFormat};
use crate::transport::ClientEndpoint;

/// Default prompt printed by the backend after each directive.
pub const DEFAULT_PROMPT: &str = "PyMOL>";

/// Default idle delay before a pending update is rendered.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(150);

/// Default time the backend gets to exit on its own after its pipes close.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(5);

/// Default time to wait for the backend after SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// Default client listen port (loopback only).
pub const DEFAULT_PORT: u16 = 2020;

/// Default session record log.
pub const DEFAULT_STATS_LOG: &str = "/var/tmp/visservers/sessions.jsonl";

/// Smallest accepted line buffer.
pub const MIN_BUFFER_SIZE: usize = 16;

/// How long each stage of backend shutdown may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownGrace {
    /// Wait for a voluntary exit after the pipes close.
    pub exit: Duration,
    /// Wait after SIGTERM to the process group.
    pub term: Duration,
    /// Wait after SIGKILL to the process group.
    pub kill: Duration,
}

impl Default for ShutdownGrace {
    fn default() -> Self {
        Self {
            exit: DEFAULT_EXIT_GRACE,
            term: DEFAULT_TERM_GRACE,
            kill: DEFAULT_KILL_GRACE,
        }
    }
}

/// Configuration for one proxy process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Backend program and its arguments.
    pub backend: Vec<String>,
    /// Where to accept the client.
    pub listen: ClientEndpoint,
    /// Line prefix marking a completed directive.
    pub prompt: String,
    /// Also require the directive echo after the prompt.
    pub echo_check: bool,
    /// Format of idle-time renders.
    pub image_format: ImageFormat,
    pub idle_timeout: Duration,
    /// Bound on each backend response wait. `None` waits forever.
    pub response_timeout: Option<Duration>,
    pub client_buffer_size: usize,
    pub backend_buffer_size: usize,
    pub shutdown: ShutdownGrace,
    /// Session record log; `None` disables the record.
    pub stats_log: Option<PathBuf>,
    /// Copy of every directive sent, for replaying a session.
    pub record_path: Option<PathBuf>,
    /// Directory for structure files handed to the backend.
    pub scratch_dir: PathBuf,
    /// First line sent to the client.
    pub banner: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend: Vec::new(),
            listen: ClientEndpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))),
            prompt: DEFAULT_PROMPT.to_string(),
            echo_check: false,
            image_format: ImageFormat::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            response_timeout: None,
            client_buffer_size: DEFAULT_CLIENT_CAPACITY,
            backend_buffer_size: DEFAULT_BACKEND_CAPACITY,
            shutdown: ShutdownGrace::default(),
            stats_log: Some(PathBuf::from(DEFAULT_STATS_LOG)),
            record_path: None,
            scratch_dir: std::env::temp_dir(),
            banner: Some(default_banner()),
        }
    }
}

impl ProxyConfig {
    /// Configuration for `backend` with every other value at its default.
    pub fn new(backend: Vec<String>) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Check values that would make the session unusable.
    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() || self.backend[0].is_empty() {
            return Err(ProxyError::Config("no backend command given".into()));
        }
        if self.prompt.is_empty() {
            return Err(ProxyError::Config("prompt must not be empty".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(ProxyError::Config("idle timeout must be positive".into()));
        }
        for (name, size) in [
            ("client", self.client_buffer_size),
            ("backend", self.backend_buffer_size),
        ] {
            if size < MIN_BUFFER_SIZE {
                return Err(ProxyError::Config(format!(
                    "{} buffer size {} is below the minimum of {}",
                    name, size, MIN_BUFFER_SIZE
                )));
            }
        }
        Ok(())
    }
}

/// Banner announcing the proxy version to the client.
pub fn default_banner() -> String {
    format!("vizproxy {}\n", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.prompt, "PyMOL>");
        assert_eq!(config.idle_timeout, Duration::from_millis(150));
        assert_eq!(config.response_timeout, None);
        assert_eq!(config.client_buffer_size, 1 << 16);
        assert_eq!(config.backend_buffer_size, 1 << 18);
        assert_eq!(config.shutdown.kill, Duration::from_secs(10));
        assert!(config.banner.as_deref().unwrap().starts_with("vizproxy "));
    }

    #[test]
    fn test_validate_requires_backend() {
        assert!(ProxyConfig::default().validate().is_err());
        assert!(ProxyConfig::new(vec!["pymol".into(), "-cq".into()]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_buffers() {
        let mut config = ProxyConfig::new(vec!["pymol".into()]);
        config.backend_buffer_size = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backend buffer size"));
    }
}
