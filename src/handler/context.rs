//! Command arguments, translations, and the context that executes them.
//!
//! A command handler never touches the backend itself. It parses a
//! [`CommandArgs`], updates the session, and returns a [`Translation`]: the
//! ordered steps to run. [`CommandContext::apply`] then runs those steps
//! through the directive channel.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::backend::{Directive, DirectiveChannel, RenderRequest, render_into};
use crate::coalesce;
use crate::error::{ProxyError, Result};
use crate::protocol::{CommandRecord, LineBuffer};
use crate::queue::ImageQueue;
use crate::session::{PendingFlags, ProxySession};

/// Model name used when a command does not name one.
pub const DEFAULT_MODEL: &str = "all";

/// Arguments of one client command, with the common modifiers split out.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandArgs {
    pub verb: String,
    /// `-defer`: do not schedule a render.
    pub defer: bool,
    /// `-push`: render as soon as possible.
    pub push: bool,
    /// `-model <name>`, `all` when absent.
    pub model: String,
    /// Remaining arguments in order.
    pub positional: Vec<String>,
}

impl CommandArgs {
    /// Split the modifiers out of a record's arguments.
    pub fn parse(record: &CommandRecord) -> Result<Self> {
        let mut args = CommandArgs {
            verb: record.verb.clone(),
            defer: false,
            push: false,
            model: DEFAULT_MODEL.to_string(),
            positional: Vec::new(),
        };

        let mut words = record.args.iter();
        while let Some(word) = words.next() {
            match word.as_str() {
                "-defer" => args.defer = true,
                "-push" => args.push = true,
                "-model" => {
                    args.model = words
                        .next()
                        .ok_or_else(|| ProxyError::malformed(&record.verb, "-model needs a value"))?
                        .clone();
                }
                _ => args.positional.push(word.clone()),
            }
        }
        Ok(args)
    }

    pub fn error(&self, reason: impl Into<String>) -> ProxyError {
        ProxyError::malformed(&self.verb, reason)
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    /// Positional argument `index`, which must be present.
    pub fn require(&self, index: usize, what: &str) -> Result<&str> {
        self.arg(index)
            .ok_or_else(|| self.error(format!("missing {} argument", what)))
    }

    /// Fail if more than `max` positional arguments were given.
    pub fn at_most(&self, max: usize) -> Result<()> {
        if self.positional.len() > max {
            return Err(self.error(format!(
                "wrong # of arguments: expected at most {}, got {}",
                max,
                self.positional.len()
            )));
        }
        Ok(())
    }

    /// Parse positional argument `index` as a number.
    pub fn number<T: FromStr>(&self, index: usize, what: &str) -> Result<T> {
        let text = self.require(index, what)?;
        text.parse()
            .map_err(|_| self.error(format!("expected a number for {}, got \"{}\"", what, text)))
    }

    /// Parse positional argument `index` as a finite float.
    pub fn float(&self, index: usize, what: &str) -> Result<f32> {
        let value: f32 = self.number(index, what)?;
        if !value.is_finite() {
            return Err(self.error(format!("{} must be finite", what)));
        }
        Ok(value)
    }

    /// Positional boolean, `default` when absent.
    pub fn boolean(&self, index: usize, default: bool) -> Result<bool> {
        match self.arg(index) {
            None => Ok(default),
            Some(text) => parse_bool(text)
                .ok_or_else(|| self.error(format!("expected boolean value but got \"{}\"", text))),
        }
    }

    /// Remove `name <value>` from the positional arguments.
    pub fn take_option(&mut self, name: &str) -> Result<Option<String>> {
        let Some(pos) = self.positional.iter().position(|a| a == name) else {
            return Ok(None);
        };
        if pos + 1 >= self.positional.len() {
            return Err(self.error(format!("{} needs a value", name)));
        }
        let value = self.positional.remove(pos + 1);
        self.positional.remove(pos);
        Ok(Some(value))
    }
}

/// Boolean words accepted by the client language.
fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Where the data of a structure load comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureSource {
    /// Data given inline as the command argument.
    Inline(String),
    /// This many raw bytes follow the command on the client stream.
    Follows(usize),
}

/// One step of a translated command.
#[derive(Debug, Clone)]
pub enum Step {
    /// Send a directive and wait for the prompt.
    Send(Directive),
    /// Flush pending view changes, render, and queue the image.
    Render(RenderRequest),
    /// Hand a structure file to the backend.
    LoadStructure {
        source: StructureSource,
        model: String,
        state: i64,
    },
}

/// Result of translating one command.
#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub steps: Vec<Step>,
    /// Flags raised on the session for this command.
    pub raised: PendingFlags,
}

impl Translation {
    /// No backend work now; only session state changed.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn send(directive: impl Into<String>) -> Self {
        Self::none().then_send(directive)
    }

    pub fn then_send(mut self, directive: impl Into<String>) -> Self {
        self.steps.push(Step::Send(Directive::new(directive)));
        self
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Directives of the `Send` steps, in order.
    pub fn directives(&self) -> Vec<&Directive> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Send(directive) => Some(directive),
                _ => None,
            })
            .collect()
    }
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything a translated command may touch while it runs.
pub struct CommandContext<'a> {
    pub session: &'a mut ProxySession,
    pub channel: &'a mut DirectiveChannel,
    pub client: &'a mut LineBuffer,
    pub queue: &'a mut ImageQueue,
    pub scratch_dir: &'a Path,
}

impl CommandContext<'_> {
    /// Run the steps in order, stopping at the first failure.
    pub async fn apply(&mut self, translation: Translation) -> Result<()> {
        for step in translation.steps {
            match step {
                Step::Send(directive) => {
                    self.channel.send_directive(self.session, &directive).await?;
                }
                Step::Render(request) => {
                    coalesce::flush(self.session, self.channel).await?;
                    render_into(self.session, self.channel, self.queue, &request).await?;
                    if request.tag.is_none() {
                        self.session.rendered();
                    }
                }
                Step::LoadStructure {
                    source,
                    model,
                    state,
                } => self.load_structure(source, &model, state).await?,
            }
        }
        Ok(())
    }

    /// Write the structure to a scratch file and have the backend load it.
    ///
    /// The backend deletes the file once loaded; it is removed here only if
    /// the exchange fails.
    async fn load_structure(&mut self, source: StructureSource, model: &str, state: i64) -> Result<()> {
        let data = match source {
            StructureSource::Inline(text) => Bytes::from(text),
            StructureSource::Follows(n) => self.client.read_exactly(n).await?,
        };

        let path = self.scratch_path();
        std::fs::write(&path, &data)?;
        tracing::debug!("wrote {} bytes of structure data to {}", data.len(), path.display());

        let directive = Directive::new(format!(
            "loadandremovepdbfile {},{},{}",
            path.display(),
            model,
            state
        ));
        let result = self.channel.send_directive(self.session, &directive).await;
        if result.is_err() {
            let _ = std::fs::remove_file(&path);
        }
        result.map(|_| ())
    }

    fn scratch_path(&self) -> PathBuf {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("vizproxy-{}-{}.pdb", std::process::id(), n))
    }
}
