//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `StoreError`: Errors from scope store operations
//! - `SendError`: Errors from outbound message delivery

use std::fmt;

/// Errors from scope store operations.
///
/// An absent or expired scope is not an error; stores return `None` for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    Unavailable { reason: String },
    /// The store has been closed.
    Closed,
    /// A scope could not be serialized for storage.
    Encode { key: String, reason: String },
    /// A stored value could not be deserialized into a scope.
    Decode { key: String, reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "scope store unavailable: {reason}"),
            Self::Closed => write!(f, "scope store is closed"),
            Self::Encode { key, reason } => {
                write!(f, "failed to encode scope {key}: {reason}")
            }
            Self::Decode { key, reason } => {
                write!(f, "failed to decode scope {key}: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from sending a message into a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The scope has no sender bound to it.
    Unbound,
    /// The network refused or failed to deliver the message.
    DeliveryFailed { reason: String },
    /// The delivery task ended before reporting a result.
    Abandoned { reason: String },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => write!(f, "no message sender is bound to this scope"),
            Self::DeliveryFailed { reason } => write!(f, "message delivery failed: {reason}"),
            Self::Abandoned { reason } => write!(f, "message delivery abandoned: {reason}"),
        }
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::Decode {
            key: "c1:alice".to_string(),
            reason: "eof".to_string(),
        };
        assert!(err.to_string().contains("c1:alice"));
        assert!(err.to_string().contains("eof"));
    }

    #[test]
    fn send_error_display() {
        let err = SendError::DeliveryFailed {
            reason: "no route".to_string(),
        };
        assert!(err.to_string().contains("no route"));
    }
}
