//! Error types for the dispatch crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `RegistryError`: Errors from command registration
//! - `HandlerError`: Failures raised by command handlers
//! - `ProcessError`: Failed turns (wraps store and handler errors via context)
//! - `DispatchError`: Events refused by the dispatcher

use palaver_core::{CommandId, ScopeKey};
use std::fmt;

/// Errors from command registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The pattern is not a valid regular expression.
    InvalidPattern { pattern: String, reason: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid command pattern '{pattern}': {reason}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// A failure raised by a command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("handler data: {e}"))
    }
}

/// A turn that could not be processed.
///
/// Use these as context wrappers over the underlying store or handler report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The scope store failed while loading, saving or deleting the scope.
    Store { key: ScopeKey },
    /// The command handler returned an error; the turn was not persisted.
    HandlerFailed { key: ScopeKey, command: CommandId },
}

impl ProcessError {
    /// Returns the scope key of the failed turn.
    #[must_use]
    pub fn key(&self) -> &ScopeKey {
        match self {
            Self::Store { key } | Self::HandlerFailed { key, .. } => key,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { key } => write!(f, "scope store failed for {key}"),
            Self::HandlerFailed { key, command } => {
                write!(f, "command {command} failed for {key}")
            }
        }
    }
}

impl std::error::Error for ProcessError {}

/// Errors from handing an event to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher is shutting down and accepts no new events.
    ShuttingDown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => write!(f, "dispatcher is shutting down"),
        }
    }
}

impl std::error::Error for DispatchError {}
