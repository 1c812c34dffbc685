//! Backend module - the rendering engine behind the proxy.
//!
//! Provides:
//! - [`ChildProcess`] - spawns and stops the real backend process
//! - [`MemoryBackend`] - scripted in-memory backend with the same capability
//! - [`DirectiveChannel`] - synchronous directive/prompt exchange with error latching
//! - [`render`] / [`render_into`] - image requests framed for the client

mod directive;
mod memory;
mod process;
mod render;

pub use directive::{Directive, DirectiveChannel, DirectiveRecorder};
pub use memory::{DEFAULT_PIPE_CAPACITY, MemoryBackend, Reply};
pub use process::{BackendIo, ChildProcess, ExitOutcome, ProcessTransport};
pub use render::{RenderRequest, RenderedImage, render, render_into};
