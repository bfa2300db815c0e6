//! Session scope keys.

use crate::id::{ConversationId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the conversation and participant halves of a key.
pub const KEY_SEPARATOR: char = ':';

/// Identity of one participant's session within one conversation.
///
/// Renders as `conversationId:fromParticipant`, which is also the key under
/// which a scope is persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    /// The conversation half of the key.
    pub conversation_id: ConversationId,
    /// The participant half of the key.
    pub participant: ParticipantId,
}

impl ScopeKey {
    /// Creates a key for a conversation and participant.
    #[must_use]
    pub fn new(conversation_id: ConversationId, participant: ParticipantId) -> Self {
        Self {
            conversation_id,
            participant,
        }
    }

    /// Returns the persisted string form of the key.
    #[must_use]
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.conversation_id, self.participant)
    }
}
