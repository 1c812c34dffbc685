//! Handler module - command translation and dispatch.
//!
//! Provides:
//! - [`CommandRegistry`] - maps client verbs to commands
//! - [`CommandContext`] - runs a command's steps against the backend
//!
//! # Example
//!
//! ```ignore
//! use vizproxy::handler::{CommandRegistry, CommandTraits, Translation};
//!
//! let mut registry = CommandRegistry::with_defaults();
//!
//! // Add a site-specific verb
//! registry.register("shadows", CommandTraits::VIEW, |args, _session| {
//!     let on = args.boolean(0, true)?;
//!     Ok(Translation::send(format!("set ray_shadows,{}", on as u8)))
//! });
//! ```

mod context;
mod registry;
mod verbs;

pub use context::{CommandArgs, CommandContext, DEFAULT_MODEL, Step, StructureSource, Translation};
pub use registry::{Command, CommandRegistry, CommandTraits, FnCommand};
pub use verbs::{DEFAULT_ATOM_SCALE, DEFAULT_LABEL_SIZE, PAN_SCALE, register_defaults};
