//! Outbound messages and the send capability handed to command handlers.
//!
//! Sending never blocks the turn: [`Outbox::send`] spawns the delivery and
//! returns a [`PendingDelivery`] the handler may await or drop. Nothing orders
//! a delivery relative to the next event for the same scope.

use crate::error::SendError;
use crate::event::MessagePayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use palaver_core::{ConversationId, EventId, ParticipantId};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A message to be sent into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// The message content.
    pub payload: MessagePayload,
    /// The event this message replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EventId>,
    /// Restricts delivery to these participants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<ParticipantId>>,
}

impl OutgoingMessage {
    /// Creates a text message.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            payload: MessagePayload::text(content),
            reply_to: None,
            to: None,
        }
    }

    /// Marks the message as a reply to an event.
    #[must_use]
    pub fn in_reply_to(mut self, event: EventId) -> Self {
        self.reply_to = Some(event);
        self
    }

    /// Restricts delivery to the given participants.
    #[must_use]
    pub fn to(mut self, participants: Vec<ParticipantId>) -> Self {
        self.to = Some(participants);
        self
    }
}

impl From<&str> for OutgoingMessage {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

impl From<String> for OutgoingMessage {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

/// Acknowledgment that the network accepted a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// The conversation the message went to.
    pub conversation_id: ConversationId,
    /// Transport sequence number, when the transport assigns one.
    pub sequence: Option<u64>,
    /// When the transport acknowledged the message.
    pub accepted_at: DateTime<Utc>,
}

/// Trait for delivering messages to the network.
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Delivers a message into a conversation.
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        message: OutgoingMessage,
    ) -> Result<DeliveryReceipt, Report<SendError>>;
}

/// Send capability bound to one conversation.
///
/// The default outbox is detached: every send resolves to
/// [`SendError::Unbound`].
#[derive(Clone, Default)]
pub struct Outbox {
    binding: Option<(ConversationId, Arc<dyn MessageSender>)>,
}

impl Outbox {
    /// Creates an outbox that sends into `conversation_id`.
    #[must_use]
    pub fn new(conversation_id: ConversationId, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            binding: Some((conversation_id, sender)),
        }
    }

    /// Returns true if a sender is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Starts delivering a message and returns without waiting for it.
    ///
    /// Must be called from within a tokio runtime. Failures are logged even
    /// if the returned handle is dropped.
    pub fn send(&self, message: impl Into<OutgoingMessage>) -> PendingDelivery {
        let Some((conversation_id, sender)) = self.binding.clone() else {
            return PendingDelivery::ready(SendError::Unbound.into());
        };

        let message = message.into();
        let handle = tokio::spawn(async move {
            let result = sender.deliver(&conversation_id, message).await;
            if let Err(report) = &result {
                warn!(%conversation_id, error = %report, "message delivery failed");
            }
            result
        });

        PendingDelivery {
            state: PendingState::Spawned(handle),
        }
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field(
                "conversation_id",
                &self.binding.as_ref().map(|(conversation_id, _)| conversation_id),
            )
            .finish()
    }
}

/// Handle to a message delivery started by [`Outbox::send`].
#[must_use = "dropping the handle detaches the delivery; await `wait` to observe the result"]
pub struct PendingDelivery {
    state: PendingState,
}

enum PendingState {
    Spawned(JoinHandle<Result<DeliveryReceipt, Report<SendError>>>),
    Ready(Report<SendError>),
}

impl PendingDelivery {
    fn ready(report: Report<SendError>) -> Self {
        Self {
            state: PendingState::Ready(report),
        }
    }

    /// Returns true once the delivery has finished, successfully or not.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match &self.state {
            PendingState::Spawned(handle) => handle.is_finished(),
            PendingState::Ready(_) => true,
        }
    }

    /// Waits for the transport's acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns the delivery failure, or [`SendError::Abandoned`] if the
    /// delivery task was cancelled or panicked.
    pub async fn wait(self) -> Result<DeliveryReceipt, Report<SendError>> {
        match self.state {
            PendingState::Spawned(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(SendError::Abandoned {
                    reason: e.to_string(),
                }
                .into()),
            },
            PendingState::Ready(report) => Err(report),
        }
    }
}

impl fmt::Debug for PendingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDelivery")
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(ConversationId, OutgoingMessage)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn deliver(
            &self,
            conversation_id: &ConversationId,
            message: OutgoingMessage,
        ) -> Result<DeliveryReceipt, Report<SendError>> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((conversation_id.clone(), message));
            Ok(DeliveryReceipt {
                conversation_id: conversation_id.clone(),
                sequence: Some(sent.len() as u64),
                accepted_at: Utc::now(),
            })
        }
    }

    struct RefusingSender;

    #[async_trait]
    impl MessageSender for RefusingSender {
        async fn deliver(
            &self,
            _conversation_id: &ConversationId,
            _message: OutgoingMessage,
        ) -> Result<DeliveryReceipt, Report<SendError>> {
            Err(SendError::DeliveryFailed {
                reason: "offline".to_string(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn bound_outbox_delivers_to_its_conversation() {
        let sender = Arc::new(RecordingSender::default());
        let outbox = Outbox::new(ConversationId::new("c1"), sender.clone());

        let receipt = outbox.send("Pong!").wait().await.expect("delivered");

        assert_eq!(receipt.conversation_id, ConversationId::new("c1"));
        assert_eq!(receipt.sequence, Some(1));
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.payload.as_text(), Some("Pong!"));
    }

    #[tokio::test]
    async fn detached_outbox_reports_unbound() {
        let outbox = Outbox::default();
        assert!(!outbox.is_bound());

        let pending = outbox.send("hello");
        assert!(pending.is_finished());
        assert!(pending.wait().await.is_err());
    }

    #[tokio::test]
    async fn delivery_failure_is_returned_to_the_waiter() {
        let outbox = Outbox::new(ConversationId::new("c1"), Arc::new(RefusingSender));

        let err = outbox.send("hello").wait().await.unwrap_err();
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn outgoing_message_builders() {
        let message = OutgoingMessage::text("hi")
            .in_reply_to(EventId::new("evt-1"))
            .to(vec![ParticipantId::new("alice")]);

        assert_eq!(message.reply_to, Some(EventId::new("evt-1")));
        assert_eq!(message.to.as_ref().map(Vec::len), Some(1));
    }
}
