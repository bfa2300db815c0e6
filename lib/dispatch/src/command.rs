//! Command registration and routing.
//!
//! The registry is an ordered list of `(pattern, handler)` pairs. Routing
//! walks it in registration order and returns the first command whose
//! pattern matches the text of a text message; every other event routes to
//! nothing.

use crate::error::{HandlerError, RegistryError};
use async_trait::async_trait;
use palaver_conversation::{ChatEvent, Scope};
use palaver_core::CommandId;
use regex::Regex;
use rootcause::prelude::Report;
use std::fmt;
use std::sync::Arc;

/// Trait for command handlers.
///
/// A handler is invoked once per turn with the scope for that turn. It
/// signals completion by calling [`Scope::finish`]; any scope it leaves
/// non-terminal is persisted for the next turn.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Handles one turn of the command.
    async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError>;
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&mut Scope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError> {
        (self.f)(scope)
    }
}

/// Wraps a closure as a [`CommandHandler`].
///
/// ```
/// use palaver_dispatch::handler_fn;
///
/// let ping = handler_fn(|scope| {
///     let _ = scope.send("Pong!");
///     scope.finish();
///     Ok(())
/// });
/// # let _ = ping;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Scope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler { f }
}

/// A registered command.
pub struct Command {
    id: CommandId,
    pattern: Regex,
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    /// Returns the registration ID.
    #[must_use]
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Returns the source of the pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Returns true if the pattern matches the text.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Returns the handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn CommandHandler> {
        &self.handler
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .finish_non_exhaustive()
    }
}

/// Ordered registry of commands.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: Vec<Arc<Command>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Appends a command. Earlier registrations take priority when routing.
    ///
    /// Duplicate patterns are accepted; only the earliest one will match.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] if the pattern does not compile.
    pub fn register(
        &mut self,
        pattern: &str,
        handler: impl CommandHandler,
    ) -> Result<CommandId, Report<RegistryError>> {
        self.register_shared(pattern, Arc::new(handler))
    }

    /// Appends a command whose handler is shared with other registrations.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] if the pattern does not compile.
    pub fn register_shared(
        &mut self,
        pattern: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<CommandId, Report<RegistryError>> {
        let pattern = Regex::new(pattern).map_err(|e| RegistryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let id = CommandId::new();
        self.commands.push(Arc::new(Command {
            id,
            pattern,
            handler,
        }));
        Ok(id)
    }

    /// Removes a command. Returns false if it was not registered.
    pub fn unregister(&mut self, id: CommandId) -> bool {
        let before = self.commands.len();
        self.commands.retain(|command| command.id != id);
        self.commands.len() != before
    }

    /// Resolves the command for an event.
    ///
    /// Only text messages can match; any other kind or payload returns `None`.
    #[must_use]
    pub fn route(&self, event: &ChatEvent) -> Option<Arc<Command>> {
        let text = event.text_content()?;
        self.route_text(text).cloned()
    }

    /// Returns the first command whose pattern matches the text.
    #[must_use]
    pub fn route_text(&self, text: &str) -> Option<&Arc<Command>> {
        self.commands.iter().find(|command| command.matches(text))
    }

    /// Gets a command by ID.
    #[must_use]
    pub fn get(&self, id: CommandId) -> Option<&Arc<Command>> {
        self.commands.iter().find(|command| command.id == id)
    }

    /// Iterates commands in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Command>> {
        self.commands.iter()
    }

    /// Returns the number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
