//! Session processor: the per-key turn state machine.
//!
//! Each key is either without a scope or has an active one. A turn:
//!
//! 1. Loads the scope for `(conversation, sender)`
//! 2. Without a scope, routes the event itself; a match starts a new scope
//! 3. With a scope, appends the event and re-routes from the routing anchor;
//!    a miss deletes the scope
//! 4. Runs the handler, then deletes the scope if it is terminal or persists
//!    it otherwise
//!
//! A handler failure abandons the turn: nothing is written, so the stored
//! scope from the previous turn stays in place for the next event.

use crate::command::{Command, CommandHandler, CommandRegistry};
use crate::error::{HandlerError, ProcessError, RegistryError};
use crate::locks::KeyedLocks;
use palaver_conversation::{
    ChatEvent, EventKind, MessageSender, Outbox, Scope, ScopeStore, StoreError,
};
use palaver_core::{CommandId, ConversationId, ScopeKey};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Which event a continuation turn is routed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAnchor {
    /// The event that started the command (first in the history).
    #[default]
    OriginalEvent,
    /// The event that arrived on this turn.
    CurrentEvent,
}

/// Session processor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// How continuation turns are routed.
    #[serde(default)]
    pub routing_anchor: RoutingAnchor,
}

/// The transition a turn took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No scope and no matching command; the event was ignored.
    Dropped,
    /// A command matched and its scope was persisted.
    Started { command: CommandId },
    /// An active scope was advanced and persisted.
    Continued { command: CommandId },
    /// The handler finished the command and the scope was deleted.
    Completed { command: CommandId },
    /// An active scope no longer routed to any command and was deleted.
    Orphaned,
}

impl Outcome {
    /// Returns the command that handled the turn, if any.
    #[must_use]
    pub fn command(&self) -> Option<CommandId> {
        match self {
            Self::Started { command } | Self::Continued { command } | Self::Completed { command } => {
                Some(*command)
            }
            Self::Dropped | Self::Orphaned => None,
        }
    }
}

/// Orchestrates scope loading, routing, handler invocation and persistence.
pub struct SessionProcessor<S: ScopeStore> {
    store: S,
    registry: RwLock<CommandRegistry>,
    sender: Arc<dyn MessageSender>,
    locks: KeyedLocks,
    config: ProcessorConfig,
}

impl<S: ScopeStore> SessionProcessor<S> {
    /// Creates a processor with an empty registry.
    pub fn new(store: S, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            store,
            registry: RwLock::new(CommandRegistry::new()),
            sender,
            locks: KeyedLocks::new(),
            config: ProcessorConfig::default(),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the registry.
    #[must_use]
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = RwLock::new(registry);
        self
    }

    /// Registers a command at the lowest priority.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] if the pattern does not compile.
    pub async fn register(
        &self,
        pattern: &str,
        handler: impl CommandHandler,
    ) -> Result<CommandId, Report<RegistryError>> {
        self.registry.write().await.register(pattern, handler)
    }

    /// Removes a command. Active scopes it governed become orphans.
    pub async fn unregister(&self, id: CommandId) -> bool {
        self.registry.write().await.unregister(id)
    }

    /// Returns the number of registered commands.
    pub async fn command_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Returns the scope store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Closes the scope store.
    ///
    /// # Errors
    ///
    /// Returns the store's error if it fails to close cleanly.
    pub async fn close(&self) -> Result<(), Report<StoreError>> {
        self.store.close().await
    }

    /// Processes one event for `conversation_id`.
    ///
    /// Turns for the same `(conversation, sender)` key are serialized; turns
    /// for different keys run concurrently. Only `message` events take part
    /// in a command; any other kind is dropped without reading or touching
    /// the stored scope.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Store`] if the store fails and
    /// [`ProcessError::HandlerFailed`] if the handler fails. In both cases
    /// the turn is not persisted.
    #[instrument(
        skip(self, event),
        fields(conversation_id = %conversation_id, participant = %event.from, kind = %event.kind())
    )]
    pub async fn process(
        &self,
        conversation_id: &ConversationId,
        event: ChatEvent,
    ) -> Result<Outcome, Report<ProcessError>> {
        let key = ScopeKey::new(conversation_id.clone(), event.from.clone());
        if event.kind() != EventKind::Message {
            debug!(%key, kind = %event.kind(), "not a message; event dropped");
            return Ok(Outcome::Dropped);
        }

        let _guard = self.locks.lock(key.clone()).await;

        let existing = self
            .store
            .get(&key)
            .await
            .map_err(|report| report.context(ProcessError::Store { key: key.clone() }))?;

        match existing {
            None => self.start(key, event).await,
            Some(scope) => self.continue_scope(key, scope, event).await,
        }
    }

    async fn start(&self, key: ScopeKey, event: ChatEvent) -> Result<Outcome, Report<ProcessError>> {
        let command = self.registry.read().await.route(&event);
        let Some(command) = command else {
            debug!(%key, "no command matched; event dropped");
            return Ok(Outcome::Dropped);
        };

        info!(%key, command = %command.id(), pattern = command.pattern(), "command started");
        let scope = Scope::start(key.clone(), event);
        self.run_turn(key, &command, scope).await
    }

    async fn continue_scope(
        &self,
        key: ScopeKey,
        mut scope: Scope,
        event: ChatEvent,
    ) -> Result<Outcome, Report<ProcessError>> {
        scope.record(event);

        let anchor = match self.config.routing_anchor {
            RoutingAnchor::OriginalEvent => scope.trigger(),
            RoutingAnchor::CurrentEvent => scope.current_event(),
        };
        let command = self.registry.read().await.route(anchor);

        let Some(command) = command else {
            warn!(%key, history = scope.history_len(), "active scope no longer routes; discarding");
            self.store
                .delete(&key)
                .await
                .map_err(|report| report.context(ProcessError::Store { key: key.clone() }))?;
            return Ok(Outcome::Orphaned);
        };

        debug!(%key, command = %command.id(), history = scope.history_len(), "continuing command");
        self.run_turn(key, &command, scope).await
    }

    async fn run_turn(
        &self,
        key: ScopeKey,
        command: &Command,
        mut scope: Scope,
    ) -> Result<Outcome, Report<ProcessError>> {
        let first_turn = scope.is_first_turn();
        scope.bind_outbox(Outbox::new(
            key.conversation_id.clone(),
            Arc::clone(&self.sender),
        ));

        if let Err(e) = command.handler().handle(&mut scope).await {
            warn!(%key, command = %command.id(), error = %e, "handler failed; turn abandoned");
            let report: Report<HandlerError> = e.into();
            return Err(report.context(ProcessError::HandlerFailed {
                key,
                command: command.id(),
            }));
        }

        if scope.is_terminal() {
            self.store
                .delete(&key)
                .await
                .map_err(|report| report.context(ProcessError::Store { key: key.clone() }))?;
            info!(%key, command = %command.id(), turns = scope.history_len(), "command completed");
            return Ok(Outcome::Completed {
                command: command.id(),
            });
        }

        self.store
            .put(&scope)
            .await
            .map_err(|report| report.context(ProcessError::Store { key: key.clone() }))?;

        Ok(if first_turn {
            Outcome::Started {
                command: command.id(),
            }
        } else {
            Outcome::Continued {
                command: command.id(),
            }
        })
    }
}
