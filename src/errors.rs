//! Typed error hierarchy for trunkguard.
//!
//! Two enums cover the two layers:
//! - `CommandError`: spawning and running external tools (`git`, `gh`, `tar`)
//! - `GuardError`: the per-item failure taxonomy every component reports
//!
//! Only `GuardError::Configuration` aborts a whole run. Everything else is
//! recorded against the item that failed and the run moves on.

use std::time::Duration;
use thiserror::Error;

/// Failure classes used for propagation decisions and the status digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    StateAmbiguous,
    InvariantViolation,
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::TransientIo => write!(f, "transient_io"),
            ErrorKind::StateAmbiguous => write!(f, "state_ambiguous"),
            ErrorKind::InvariantViolation => write!(f, "invariant_violation"),
            ErrorKind::Configuration => write!(f, "configuration"),
        }
    }
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{program}` was not found on PATH")]
    NotFound { program: String },

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` failed: {detail}")]
    Failed { command: String, detail: String },
}

/// Per-item failure taxonomy.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Network or remote unreachable; retried by the next scheduled run.
    #[error("transient failure: {0}")]
    TransientIo(String),

    /// Dirty+merged or dirty+stale; routed to a human, never auto-resolved.
    #[error("ambiguous state: {0}")]
    StateAmbiguous(String),

    /// A destructive step was about to run without a covering evacuation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Missing canonical root, missing tool, unreadable config. Fatal to the run.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GuardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::TransientIo(_) => ErrorKind::TransientIo,
            GuardError::StateAmbiguous(_) => ErrorKind::StateAmbiguous,
            GuardError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            GuardError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, GuardError::Configuration(_))
    }
}

impl From<CommandError> for GuardError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::NotFound { .. } => GuardError::Configuration(err.to_string()),
            other => GuardError::TransientIo(other.to_string()),
        }
    }
}

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        GuardError::TransientIo(err.to_string())
    }
}

impl From<git2::Error> for GuardError {
    fn from(err: git2::Error) -> Self {
        GuardError::TransientIo(format!("git2: {}", err.message()))
    }
}
