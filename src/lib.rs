//! # vizproxy
//!
//! Render proxy between a visualization client and a script-driven
//! molecular rendering backend.
//!
//! The proxy accepts one GUI client, starts the backend as a child process,
//! and translates the client's command language into backend directives.
//! Interactive view changes are coalesced between renders, and the rendered
//! images are streamed back to the client without ever blocking on it.
//!
//! ## Architecture
//!
//! - **Client side** (TCP or Unix socket): newline-delimited commands in,
//!   framed images and error replies out
//! - **Backend side** (stdio pipes): one directive per line, answered by a
//!   prompt line or an announced image payload
//!
//! ## Example
//!
//! ```ignore
//! use vizproxy::{ChildProcess, ClientEndpoint, ClientListener, Proxy, ProxyConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> vizproxy::Result<()> {
//!     let config = ProxyConfig::new(vec!["pymol".into(), "-cqi".into()]);
//!     let listener = ClientListener::bind(&config.listen).await?;
//!     let mut conn = listener.accept().await?;
//!
//!     let mut backend = ChildProcess::start(&config.backend)?;
//!     let mut proxy = Proxy::new(config);
//!     proxy.run(&mut backend, conn.reader, &mut conn.writer).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod session;
pub mod stats;
pub mod transport;

pub use backend::{ChildProcess, ExitOutcome, MemoryBackend, ProcessTransport};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use handler::CommandRegistry;
pub use proxy::{Proxy, SessionEnd};
pub use session::ProxySession;
pub use stats::SessionRecord;
pub use transport::{ClientEndpoint, ClientListener};
