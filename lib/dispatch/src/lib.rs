//! Command dispatch for palaver.
//!
//! Incoming chat events are routed to commands by matching message text
//! against registered patterns. A command that does not finish on its first
//! turn keeps a [`Scope`](palaver_conversation::Scope) for the sender, and
//! later messages from that sender continue the same command until it
//! finishes, routes nowhere, or expires.
//!
//! - [`CommandRegistry`]: ordered `(pattern, handler)` table, first match wins
//! - [`SessionProcessor`]: runs one turn for one event
//! - [`Dispatcher`]: serializes turns per `(conversation, sender)` key

pub mod command;
pub mod dispatcher;
pub mod error;
pub mod locks;
pub mod processor;

pub use command::{Command, CommandHandler, CommandRegistry, FnHandler, handler_fn};
pub use dispatcher::{DEFAULT_WORKER_IDLE, Dispatcher, DispatcherConfig};
pub use error::{DispatchError, HandlerError, ProcessError, RegistryError};
pub use locks::{KeyGuard, KeyedLocks};
pub use processor::{Outcome, ProcessorConfig, RoutingAnchor, SessionProcessor};
