//! Error types for vizproxy.

use std::time::Duration;

use thiserror::Error;

use crate::backend::ExitOutcome;

/// Main error type for all proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on a client or backend stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (session records only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (bad image announcement, oversized line, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The named stream reached end of file.
    #[error("Connection closed: {0}")]
    ConnectionClosed(&'static str),

    /// The client sent a verb with no registered command.
    #[error("unknown command \"{0}\"")]
    CommandNotFound(String),

    /// The client sent a known verb with unusable arguments.
    #[error("{verb}: {reason}")]
    MalformedCommand { verb: String, reason: String },

    /// A previous backend exchange failed and the error latch is still set.
    #[error("backend channel faulted: {0}")]
    Faulted(String),

    /// The backend did not answer within the configured response timeout.
    #[error("no response from backend within {0:?}")]
    ResponseTimeout(Duration),

    /// The rendering backend exited while the session was running.
    #[error("rendering backend exited unexpectedly ({0})")]
    ChildDied(ExitOutcome),

    /// The rendering backend could not be started.
    #[error("failed to start \"{program}\": {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The rendering backend could not be stopped.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Build a `MalformedCommand` error.
    pub fn malformed(verb: &str, reason: impl Into<String>) -> Self {
        ProxyError::MalformedCommand {
            verb: verb.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that only concern the command that produced them.
    ///
    /// These are reported back to the client and the session continues.
    /// Everything else ends the session.
    pub fn is_command_local(&self) -> bool {
        matches!(
            self,
            ProxyError::CommandNotFound(_) | ProxyError::MalformedCommand { .. }
        )
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
