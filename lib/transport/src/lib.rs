//! Network plumbing for palaver.
//!
//! [`Ingress`] decides which inbound events reach the dispatcher. The
//! [`nats`] module connects the engine to a NATS deployment: inbound chat
//! events arrive on a core subscription, scopes live in a JetStream
//! key-value bucket and outbound messages are published to a JetStream
//! stream.

pub mod error;
pub mod ingress;
pub mod nats;

pub use error::TransportError;
pub use ingress::{AcceptancePolicy, Admission, Ingress, RequestAcceptor};
pub use nats::{
    NatsConfig, NatsMessageSender, NatsRequestAcceptor, NatsScopeStore, chat_events, connect,
};
