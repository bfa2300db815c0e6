//! Chat events delivered by the messaging network.
//!
//! A [`ChatEvent`] is immutable once constructed. The `kind` tag selects an
//! [`EventBody`] variant, and each variant carries exactly the fields that
//! kind populates: message events always have a payload, membership events
//! never have recipients.

use chrono::{DateTime, Utc};
use palaver_core::{ConversationId, EventId, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use ulid::Ulid;

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Sent by this bot's own account.
    #[serde(rename = "self")]
    Own,
    /// Sent by someone else.
    Other,
}

/// The kind of an event, without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Request,
    Accept,
    Reject,
    ParticipantRemoved,
    ParticipantJoined,
    ParticipantLeft,
}

impl EventKind {
    /// Returns true for the membership kinds (removed, joined, left).
    #[must_use]
    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            Self::ParticipantRemoved | Self::ParticipantJoined | Self::ParticipantLeft
        )
    }

    /// Returns the wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Request => "request",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::ParticipantRemoved => "participant_removed",
            Self::ParticipantJoined => "participant_joined",
            Self::ParticipantLeft => "participant_left",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a message event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Plain text.
    Text { content: String },
    /// Anything else the network can carry (files, reactions, cards).
    Data {
        content_type: String,
        content: JsonValue,
    },
}

impl MessagePayload {
    /// Creates a text payload.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Returns the text content, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            Self::Data { .. } => None,
        }
    }
}

/// Kind-specific event fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    /// A chat message.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<Vec<ParticipantId>>,
        payload: MessagePayload,
    },
    /// A contact or conversation request.
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<Vec<ParticipantId>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<JsonValue>,
    },
    /// Acceptance of an earlier request.
    Accept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<Vec<ParticipantId>>,
    },
    /// Rejection of an earlier request.
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<Vec<ParticipantId>>,
    },
    ParticipantRemoved,
    ParticipantJoined,
    ParticipantLeft,
}

impl EventBody {
    /// Returns the kind tag of this body.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message { .. } => EventKind::Message,
            Self::Request { .. } => EventKind::Request,
            Self::Accept { .. } => EventKind::Accept,
            Self::Reject { .. } => EventKind::Reject,
            Self::ParticipantRemoved => EventKind::ParticipantRemoved,
            Self::ParticipantJoined => EventKind::ParticipantJoined,
            Self::ParticipantLeft => EventKind::ParticipantLeft,
        }
    }
}

/// Verification material attached by the network.
///
/// Which fields are present depends on the event kind. Nothing in this
/// workspace verifies it; it is carried so handlers and stores keep the
/// event intact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProof {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// One occurrence in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Network-assigned event identifier.
    pub id: EventId,
    /// Whether the bot itself produced the event.
    pub origin: Origin,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// The conversation the event belongs to.
    pub conversation_id: ConversationId,
    /// The participant who produced the event.
    pub from: ParticipantId,
    /// The event this one replies to or acts upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<EventId>,
    /// Verification material.
    #[serde(default)]
    pub proof: RawProof,
    /// Kind-specific fields.
    #[serde(flatten)]
    pub body: EventBody,
}

impl ChatEvent {
    /// Creates an event from another participant with a fresh local ID.
    #[must_use]
    pub fn new(conversation_id: ConversationId, from: ParticipantId, body: EventBody) -> Self {
        Self {
            id: EventId::new(Ulid::new().to_string()),
            origin: Origin::Other,
            timestamp: Utc::now(),
            conversation_id,
            from,
            reference: None,
            proof: RawProof::default(),
            body,
        }
    }

    /// Creates a text message event from another participant.
    #[must_use]
    pub fn text(
        conversation_id: impl Into<ConversationId>,
        from: impl Into<ParticipantId>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            conversation_id.into(),
            from.into(),
            EventBody::Message {
                to: None,
                payload: MessagePayload::text(content),
            },
        )
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the event ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the referenced event.
    #[must_use]
    pub fn with_reference(mut self, reference: EventId) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Sets the verification material.
    #[must_use]
    pub fn with_proof(mut self, proof: RawProof) -> Self {
        self.proof = proof;
        self
    }

    /// Returns the kind of the event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// Returns true if someone other than the bot produced the event.
    #[must_use]
    pub fn is_from_other(&self) -> bool {
        self.origin == Origin::Other
    }

    /// Returns the message payload, for message events.
    #[must_use]
    pub fn payload(&self) -> Option<&MessagePayload> {
        match &self.body {
            EventBody::Message { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Returns the text content of a text message; `None` for everything else.
    #[must_use]
    pub fn text_content(&self) -> Option<&str> {
        self.payload().and_then(MessagePayload::as_text)
    }

    /// Returns the explicit recipients, if the kind carries any.
    #[must_use]
    pub fn recipients(&self) -> Option<&[ParticipantId]> {
        match &self.body {
            EventBody::Message { to, .. }
            | EventBody::Request { to, .. }
            | EventBody::Accept { to }
            | EventBody::Reject { to } => to.as_deref(),
            EventBody::ParticipantRemoved
            | EventBody::ParticipantJoined
            | EventBody::ParticipantLeft => None,
        }
    }
}
