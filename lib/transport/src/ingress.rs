//! Inbound event admission.
//!
//! Only message events from other participants reach the command engine.
//! Join requests are answered by the acceptance policy and everything else
//! is dropped here.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use palaver_conversation::{ChatEvent, EventKind, Origin, ScopeStore, SendError};
use palaver_dispatch::{DispatchError, Dispatcher};
use rootcause::prelude::Report;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answers participation requests on behalf of this agent.
#[async_trait]
pub trait RequestAcceptor: Send + Sync + 'static {
    /// Accepts the request carried by `request`.
    async fn accept(&self, request: &ChatEvent) -> Result<(), Report<SendError>>;
}

/// What to do with inbound `request` events.
#[derive(Clone, Default)]
pub enum AcceptancePolicy {
    /// Leave requests unanswered.
    #[default]
    Ignore,
    /// Accept every request.
    AutoAccept(Arc<dyn RequestAcceptor>),
}

impl fmt::Debug for AcceptancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => f.write_str("Ignore"),
            Self::AutoAccept(_) => f.write_str("AutoAccept"),
        }
    }
}

/// How an inbound event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued for the command engine.
    Dispatched,
    /// Sent by this agent; never processed.
    OwnEvent,
    /// A request answered by the acceptance policy.
    RequestAccepted,
    /// A request left unanswered.
    RequestIgnored,
    /// A request whose acceptance could not be sent.
    RequestAcceptFailed,
    /// A kind the command engine does not handle.
    Ignored(EventKind),
}

/// Filters inbound events and feeds messages to a [`Dispatcher`].
pub struct Ingress<S: ScopeStore> {
    dispatcher: Arc<Dispatcher<S>>,
    policy: AcceptancePolicy,
}

impl<S: ScopeStore> Ingress<S> {
    /// Creates an ingress that ignores requests.
    pub fn new(dispatcher: Arc<Dispatcher<S>>) -> Self {
        Self {
            dispatcher,
            policy: AcceptancePolicy::Ignore,
        }
    }

    /// Sets the request acceptance policy.
    #[must_use]
    pub fn with_policy(mut self, policy: AcceptancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    /// Admits one inbound event.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShuttingDown`] if a message arrives after the
    /// dispatcher stopped accepting events.
    pub async fn admit(&self, event: ChatEvent) -> Result<Admission, Report<DispatchError>> {
        if event.origin == Origin::Own {
            return Ok(Admission::OwnEvent);
        }

        match event.kind() {
            EventKind::Message => {
                self.dispatcher.dispatch(event)?;
                Ok(Admission::Dispatched)
            }
            EventKind::Request => Ok(self.answer_request(&event).await),
            kind => {
                debug!(
                    conversation_id = %event.conversation_id,
                    participant = %event.from,
                    %kind,
                    "event kind not handled"
                );
                Ok(Admission::Ignored(kind))
            }
        }
    }

    async fn answer_request(&self, event: &ChatEvent) -> Admission {
        let AcceptancePolicy::AutoAccept(acceptor) = &self.policy else {
            debug!(conversation_id = %event.conversation_id, participant = %event.from, "request ignored");
            return Admission::RequestIgnored;
        };

        match acceptor.accept(event).await {
            Ok(()) => {
                info!(conversation_id = %event.conversation_id, participant = %event.from, "request accepted");
                Admission::RequestAccepted
            }
            Err(report) => {
                warn!(
                    conversation_id = %event.conversation_id,
                    participant = %event.from,
                    error = %report,
                    "failed to accept request"
                );
                Admission::RequestAcceptFailed
            }
        }
    }

    /// Admits events until the stream ends or `shutdown` fires, then drains
    /// the dispatcher.
    ///
    /// Returns the number of events dispatched.
    pub async fn run<St>(&self, events: St, shutdown: CancellationToken) -> u64
    where
        St: Stream<Item = ChatEvent> + Send,
    {
        let mut events = pin!(events);
        let mut dispatched = 0u64;

        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown requested; stopping ingress");
                    break;
                }
                next = events.next() => match next {
                    Some(event) => event,
                    None => {
                        info!("event stream ended");
                        break;
                    }
                },
            };

            match self.admit(event).await {
                Ok(Admission::Dispatched) => dispatched += 1,
                Ok(_) => {}
                Err(report) => {
                    warn!(error = %report, "dispatcher refused event; stopping ingress");
                    break;
                }
            }
        }

        self.dispatcher.shutdown().await;
        dispatched
    }
}
