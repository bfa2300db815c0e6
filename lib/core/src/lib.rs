//! Core domain types and utilities for the palaver command dispatcher.
//!
//! This crate provides the identifier types, scope keys and error handling
//! foundation shared by every other crate in the workspace.

pub mod error;
pub mod id;
pub mod key;

pub use error::Result;
pub use id::{CommandId, ConversationId, EventId, ParseIdError, ParticipantId};
pub use key::{KEY_SEPARATOR, ScopeKey};
