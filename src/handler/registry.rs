//! Command registry for translating client records.
//!
//! The registry maps verbs to commands. Each command is registered with its
//! [`CommandTraits`], which decide the flags the registry raises after the
//! command translated successfully:
//!
//! - `INVALIDATE_CACHE` unless the command is cache-transparent
//! - `UPDATE_PENDING` unless `-defer` was given without `-push`
//! - `FORCE_UPDATE` when `-push` was given
//!
//! # Example
//!
//! ```ignore
//! use vizproxy::handler::{CommandRegistry, CommandTraits, Translation};
//!
//! let mut registry = CommandRegistry::new();
//!
//! registry.register("refresh", CommandTraits::VIEW, |_args, _session| {
//!     Ok(Translation::send("refresh"))
//! });
//! ```

use std::collections::HashMap;

use super::context::{CommandArgs, Translation};
use crate::error::{ProxyError, Result};
use crate::protocol::CommandRecord;
use crate::session::{PendingFlags, ProxySession};

/// How a command interacts with rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTraits {
    /// The command does not change what a cached image shows.
    pub cache_transparent: bool,
    /// The command asks for a render (subject to `-defer`/`-push`).
    pub schedules_update: bool,
}

impl CommandTraits {
    /// Changes the scene and needs a new image.
    pub const VIEW: Self = Self {
        cache_transparent: false,
        schedules_update: true,
    };

    /// Needs a new image but the cache stays valid.
    pub const CACHE_TRANSPARENT: Self = Self {
        cache_transparent: true,
        schedules_update: true,
    };

    /// Does its own work immediately; no render is scheduled.
    pub const IMMEDIATE: Self = Self {
        cache_transparent: true,
        schedules_update: false,
    };
}

/// Trait for command translators.
pub trait Command: Send + Sync + 'static {
    /// Parse arguments, update the session, and return the steps to run.
    ///
    /// Must not change the session when it returns an error.
    fn translate(&self, args: CommandArgs, session: &mut ProxySession) -> Result<Translation>;
}

/// Adapter for plain functions and closures.
pub struct FnCommand<F>(F);

impl<F> Command for FnCommand<F>
where
    F: Fn(CommandArgs, &mut ProxySession) -> Result<Translation> + Send + Sync + 'static,
{
    fn translate(&self, args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
        (self.0)(args, session)
    }
}

/// Entry for a registered command.
struct CommandEntry {
    command: Box<dyn Command>,
    traits: CommandTraits,
}

/// Registry mapping verbs to commands.
pub struct CommandRegistry {
    commands: HashMap<String, CommandEntry>,
}

impl CommandRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Registry with every built-in verb.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        super::verbs::register_defaults(&mut registry);
        registry
    }

    /// Register a command function under `verb`, replacing any previous one.
    pub fn register<F>(&mut self, verb: &str, traits: CommandTraits, command: F)
    where
        F: Fn(CommandArgs, &mut ProxySession) -> Result<Translation> + Send + Sync + 'static,
    {
        self.register_command(verb, traits, Box::new(FnCommand(command)));
    }

    /// Register a boxed command under `verb`.
    pub fn register_command(&mut self, verb: &str, traits: CommandTraits, command: Box<dyn Command>) {
        self.commands
            .insert(verb.to_string(), CommandEntry { command, traits });
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.commands.contains_key(verb)
    }

    /// Traits of a registered verb.
    pub fn traits(&self, verb: &str) -> Option<CommandTraits> {
        self.commands.get(verb).map(|e| e.traits)
    }

    /// Registered verbs, sorted.
    pub fn verbs(&self) -> Vec<&str> {
        let mut verbs: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        verbs.sort_unstable();
        verbs
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Translate one record and raise its flags on the session.
    ///
    /// # Errors
    ///
    /// `CommandNotFound` for an unknown verb, `MalformedCommand` for bad
    /// arguments. The session is unchanged in both cases.
    pub fn translate(&self, record: &CommandRecord, session: &mut ProxySession) -> Result<Translation> {
        let entry = self
            .commands
            .get(&record.verb)
            .ok_or_else(|| ProxyError::CommandNotFound(record.verb.clone()))?;

        let args = CommandArgs::parse(record)?;
        let (defer, push) = (args.defer, args.push);
        let mut translation = entry.command.translate(args, session)?;

        let mut raised = PendingFlags::empty();
        if !entry.traits.cache_transparent {
            raised |= PendingFlags::INVALIDATE_CACHE;
        }
        if entry.traits.schedules_update {
            if !defer || push {
                raised |= PendingFlags::UPDATE_PENDING;
            }
            if push {
                raised |= PendingFlags::FORCE_UPDATE;
            }
        }
        session.flags.insert(raised);
        translation.raised = raised;
        Ok(translation)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
