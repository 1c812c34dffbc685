//! Client command records.
//!
//! The client sends one command per line: a verb followed by
//! whitespace-separated arguments. An argument may be grouped with braces
//! (which nest and may span lines) or double quotes, so a record is complete
//! only once every group opened on previous lines has been closed.

use std::fmt;

use crate::error::{ProxyError, Result};

/// Largest record the assembler will accumulate across lines (1MB).
pub const MAX_RECORD_SIZE: usize = 1 << 20;

/// One parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub verb: String,
    pub args: Vec<String>,
}

impl CommandRecord {
    /// Build a record from already separated words.
    pub fn new(verb: impl Into<String>, args: &[&str]) -> Self {
        Self {
            verb: verb.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Parse a single complete record. Returns `None` for a blank line.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let mut words = tokenize(text)?.into_iter();
        Ok(words.next().map(|verb| Self {
            verb,
            args: words.collect(),
        }))
    }
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Joins client lines until they form a complete record.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    pending: String,
}

impl CommandAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record is partially assembled.
    pub fn is_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Add one line (terminator included) and return the record it completes.
    ///
    /// Blank records yield `Ok(None)`, as do incomplete ones. A record that
    /// grows past [`MAX_RECORD_SIZE`] is discarded with an error.
    pub fn push_line(&mut self, line: &[u8]) -> Result<Option<CommandRecord>> {
        self.pending.push_str(&String::from_utf8_lossy(line));

        if !is_complete(&self.pending) {
            if self.pending.len() > MAX_RECORD_SIZE {
                self.pending.clear();
                return Err(ProxyError::malformed(
                    "command",
                    format!("unterminated group longer than {} bytes", MAX_RECORD_SIZE),
                ));
            }
            return Ok(None);
        }

        let text = std::mem::take(&mut self.pending);
        CommandRecord::parse(&text)
    }
}

/// Whether every brace group and quoted string in `text` is closed.
fn is_complete(text: &str) -> bool {
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if depth == 0 => quoted = !quoted,
            '{' if !quoted => depth += 1,
            '}' if !quoted && depth > 0 => depth -= 1,
            _ => {}
        }
    }
    depth == 0 && !quoted
}

/// Split text into words, honoring brace groups and quotes.
pub fn split_words(text: &str) -> Result<Vec<String>> {
    tokenize(text)
}

/// Split a complete record into words, removing group delimiters.
fn tokenize(text: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let Some(&first) = chars.peek() else {
            break;
        };
        let mut word = String::new();

        match first {
            '{' => {
                chars.next();
                let mut depth = 1;
                loop {
                    let Some(c) = chars.next() else {
                        return Err(ProxyError::malformed("command", "missing close-brace"));
                    };
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        '\\' => {
                            word.push(c);
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                            continue;
                        }
                        _ => {}
                    }
                    word.push(c);
                }
            }
            '"' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => word.push('\n'),
                            Some('t') => word.push('\t'),
                            Some(c) => word.push(c),
                            None => return Err(ProxyError::malformed("command", "missing close-quote")),
                        },
                        Some(c) => word.push(c),
                        None => return Err(ProxyError::malformed("command", "missing close-quote")),
                    }
                }
            }
            _ => {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    word.push(c);
                }
            }
        }
        words.push(word);
    }
    Ok(words)
}
