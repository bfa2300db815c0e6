//! Conversation model for the palaver command dispatcher.
//!
//! This crate provides:
//!
//! - **Chat Events**: The immutable event model delivered by the network
//! - **Scope**: Per-conversation, per-participant session state
//! - **Outbox**: The send capability handed to command handlers
//! - **Scope Store**: TTL-bounded scope persistence

pub mod error;
pub mod event;
pub mod outbox;
pub mod scope;
pub mod store;

pub use error::{SendError, StoreError};
pub use event::{ChatEvent, EventBody, EventKind, MessagePayload, Origin, RawProof};
pub use outbox::{DeliveryReceipt, MessageSender, OutgoingMessage, Outbox, PendingDelivery};
pub use scope::Scope;
pub use store::{DEFAULT_SCOPE_TTL, MemoryScopeStore, ScopeStore, decode_scope, encode_scope};
