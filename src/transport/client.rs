//! Client endpoint: TCP or Unix Domain Socket.
//!
//! The proxy serves exactly one GUI client per process. It binds the
//! configured endpoint, accepts a single connection, and splits it into a
//! reader for the command stream and a [`ClientWriter`] for images.
//!
//! # Example
//!
//! ```ignore
//! use vizproxy::transport::{ClientEndpoint, ClientListener};
//!
//! let endpoint: ClientEndpoint = "unix:/tmp/vizproxy.sock".parse()?;
//! let listener = ClientListener::bind(&endpoint).await?;
//! let connection = listener.accept().await?;
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::net::{TcpListener, UnixListener, tcp, unix};

use super::{BoxedReader, ClientSink};
use crate::error::{ProxyError, Result};

/// Where the proxy listens for its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEndpoint {
    /// TCP address, e.g. `127.0.0.1:2020`.
    Tcp(SocketAddr),
    /// Unix Domain Socket path, written as `unix:/path`.
    Unix(PathBuf),
}

impl FromStr for ClientEndpoint {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ProxyError::Config("empty unix socket path".into()));
            }
            return Ok(ClientEndpoint::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(ClientEndpoint::Tcp)
            .map_err(|e| ProxyError::Config(format!("bad listen address \"{}\": {}", s, e)))
    }
}

impl fmt::Display for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEndpoint::Tcp(addr) => write!(f, "{}", addr),
            ClientEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Listener for the single client connection.
pub enum ClientListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl ClientListener {
    /// Bind the endpoint.
    ///
    /// For Unix sockets, any existing socket file at the path is removed
    /// before binding and the file is removed again when the listener drops.
    pub async fn bind(endpoint: &ClientEndpoint) -> Result<Self> {
        match endpoint {
            ClientEndpoint::Tcp(addr) => Ok(ClientListener::Tcp(TcpListener::bind(addr).await?)),
            ClientEndpoint::Unix(path) => {
                if Path::new(path).exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(ClientListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The bound endpoint, with the actual port for `:0` TCP binds.
    pub fn local_endpoint(&self) -> Result<ClientEndpoint> {
        match self {
            ClientListener::Tcp(listener) => Ok(ClientEndpoint::Tcp(listener.local_addr()?)),
            ClientListener::Unix { path, .. } => Ok(ClientEndpoint::Unix(path.clone())),
        }
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<ClientConnection> {
        match self {
            ClientListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(ClientConnection {
                    reader: Box::new(reader),
                    writer: ClientWriter::Tcp(writer),
                    peer: peer.to_string(),
                })
            }
            ClientListener::Unix { listener, path } => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(ClientConnection {
                    reader: Box::new(reader),
                    writer: ClientWriter::Unix(writer),
                    peer: path.display().to_string(),
                })
            }
        }
    }
}

impl Drop for ClientListener {
    fn drop(&mut self) {
        if let ClientListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// An accepted client, split into its two directions.
pub struct ClientConnection {
    pub reader: BoxedReader,
    pub writer: ClientWriter,
    /// Peer description for logs.
    pub peer: String,
}

/// Write half of the client connection.
pub enum ClientWriter {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl ClientSink for ClientWriter {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientWriter::Tcp(w) => w.try_write(buf),
            ClientWriter::Unix(w) => w.try_write(buf),
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            ClientWriter::Tcp(w) => w.writable().await,
            ClientWriter::Unix(w) => w.writable().await,
        }
    }
}
