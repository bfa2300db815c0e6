//! Error types for the transport crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `TransportError`: Connecting to the network and setting up its resources

use std::fmt;

/// Errors from the network transport.
///
/// These only occur while establishing the transport. Disconnects after
/// startup are reported through the connection's event log and retried by
/// the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server could not be reached.
    Connect { url: String, reason: String },
    /// Subscribing to the inbound subject failed.
    Subscribe { subject: String, reason: String },
    /// A stream or bucket could not be created or opened.
    Setup { resource: String, reason: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { url, reason } => write!(f, "failed to connect to {url}: {reason}"),
            Self::Subscribe { subject, reason } => {
                write!(f, "failed to subscribe to {subject}: {reason}")
            }
            Self::Setup { resource, reason } => {
                write!(f, "failed to set up {resource}: {reason}")
            }
        }
    }
}

impl std::error::Error for TransportError {}
