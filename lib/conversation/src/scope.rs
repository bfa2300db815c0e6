//! Session scope: handler state carried across the turns of one command.
//!
//! A scope belongs to one `(conversation, participant)` pair and lives from
//! the turn that started a command until the handler marks it terminal, the
//! command can no longer be routed, or the store's TTL drops it.

use crate::event::ChatEvent;
use crate::outbox::{OutgoingMessage, Outbox, PendingDelivery};
use chrono::{DateTime, Utc};
use palaver_core::{ConversationId, ParticipantId, ScopeKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Mutable session state for one in-progress command.
///
/// The event history is never empty: the triggering event is held apart
/// from the continuation events, so `history()` always starts with the event
/// that originally matched the command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    key: ScopeKey,
    trigger: ChatEvent,
    #[serde(default)]
    continuations: Vec<ChatEvent>,
    #[serde(default)]
    data: JsonValue,
    #[serde(default)]
    terminal: bool,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    outbox: Outbox,
}

impl Scope {
    /// Creates a scope whose history is the single triggering event.
    #[must_use]
    pub fn start(key: ScopeKey, trigger: ChatEvent) -> Self {
        let now = Utc::now();
        Self {
            key,
            trigger,
            continuations: Vec::new(),
            data: JsonValue::Null,
            terminal: false,
            started_at: now,
            updated_at: now,
            outbox: Outbox::default(),
        }
    }

    /// Appends an event to the history, making it the current event.
    pub fn record(&mut self, event: ChatEvent) {
        self.continuations.push(event);
        self.updated_at = Utc::now();
    }

    /// Returns the key this scope is stored under.
    #[must_use]
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Returns the conversation this scope belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.key.conversation_id
    }

    /// Returns the participant this scope belongs to.
    #[must_use]
    pub fn participant(&self) -> &ParticipantId {
        &self.key.participant
    }

    /// Returns the event that started the command.
    #[must_use]
    pub fn trigger(&self) -> &ChatEvent {
        &self.trigger
    }

    /// Returns the most recent event.
    #[must_use]
    pub fn current_event(&self) -> &ChatEvent {
        self.continuations.last().unwrap_or(&self.trigger)
    }

    /// Returns the text of the most recent event, if it is a text message.
    #[must_use]
    pub fn current_text(&self) -> Option<&str> {
        self.current_event().text_content()
    }

    /// Iterates the full history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ChatEvent> {
        std::iter::once(&self.trigger).chain(self.continuations.iter())
    }

    /// Returns the number of events in the history.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.continuations.len() + 1
    }

    /// Returns true on the turn that started the command.
    #[must_use]
    pub fn is_first_turn(&self) -> bool {
        self.continuations.is_empty()
    }

    /// Returns the handler-owned data slot.
    #[must_use]
    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    /// Returns the handler-owned data slot for in-place edits.
    pub fn data_mut(&mut self) -> &mut JsonValue {
        &mut self.data
    }

    /// Decodes the data slot, returning `None` while it is still empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot holds data of a different shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        if self.data.is_null() {
            return Ok(None);
        }
        serde_json::from_value(self.data.clone()).map(Some)
    }

    /// Replaces the data slot with an encoded value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded as JSON.
    pub fn set_data<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.data = serde_json::to_value(value)?;
        Ok(())
    }

    /// Marks the command as finished; the scope is discarded after this turn.
    pub fn finish(&mut self) {
        self.terminal = true;
    }

    /// Sets the terminal flag directly.
    pub fn set_terminal(&mut self, terminal: bool) {
        self.terminal = terminal;
    }

    /// Returns true once the command has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// When the command started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the scope last received an event.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Binds the send capability for this turn.
    pub fn bind_outbox(&mut self, outbox: Outbox) {
        self.outbox = outbox;
    }

    /// Returns the send capability bound for this turn.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Sends a message into this scope's conversation without waiting.
    pub fn send(&self, message: impl Into<OutgoingMessage>) -> PendingDelivery {
        self.outbox.send(message)
    }

    /// Sends a message as a reply to the current event without waiting.
    pub fn reply(&self, message: impl Into<OutgoingMessage>) -> PendingDelivery {
        let message = message.into().in_reply_to(self.current_event().id.clone());
        self.outbox.send(message)
    }
}
