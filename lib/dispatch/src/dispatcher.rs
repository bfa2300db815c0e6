//! Per-key event dispatch.
//!
//! The dispatcher owns one worker task per active `(conversation, sender)`
//! key. Events for a key are queued to its worker and processed strictly in
//! arrival order, while workers for different keys run in parallel. A worker
//! that stays idle retires; the next event for its key spawns a fresh one.

use crate::error::DispatchError;
use crate::processor::SessionProcessor;
use palaver_conversation::{ChatEvent, ScopeStore};
use palaver_core::ScopeKey;
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Default idle time after which a key's worker retires.
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(30);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a worker waits for its next event before retiring.
    pub worker_idle: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_idle: DEFAULT_WORKER_IDLE,
        }
    }
}

#[derive(Debug, Default)]
struct Workers {
    queues: HashMap<ScopeKey, mpsc::UnboundedSender<ChatEvent>>,
    closed: bool,
}

/// Routes events to per-key workers backed by a [`SessionProcessor`].
pub struct Dispatcher<S: ScopeStore> {
    processor: Arc<SessionProcessor<S>>,
    config: DispatcherConfig,
    workers: Arc<Mutex<Workers>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<S: ScopeStore> Dispatcher<S> {
    /// Creates a dispatcher.
    pub fn new(processor: Arc<SessionProcessor<S>>, config: DispatcherConfig) -> Self {
        Self {
            processor,
            config,
            workers: Arc::new(Mutex::new(Workers::default())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the processor.
    pub fn processor(&self) -> &Arc<SessionProcessor<S>> {
        &self.processor
    }

    /// Returns the number of keys with a live worker.
    pub fn active_keys(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queues
            .len()
    }

    /// Queues an event for its key's worker, starting one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShuttingDown`] once [`Dispatcher::shutdown`]
    /// or [`Dispatcher::abort`] has been called.
    pub fn dispatch(&self, event: ChatEvent) -> Result<(), Report<DispatchError>> {
        let key = ScopeKey::new(event.conversation_id.clone(), event.from.clone());
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.closed {
            return Err(DispatchError::ShuttingDown.into());
        }

        let event = match workers.queues.get(&key) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return Ok(()),
                // The worker is gone without having deregistered; replace it.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // A fresh receiver cannot be closed.
        let _ = tx.send(event);
        workers.queues.insert(key.clone(), tx);
        drop(workers);

        debug!(%key, "starting worker");
        self.tracker.spawn(run_worker(
            key,
            rx,
            Arc::clone(&self.processor),
            Arc::clone(&self.workers),
            self.config.worker_idle,
            self.cancel.clone(),
        ));
        Ok(())
    }

    /// Stops accepting events and waits for every queued event to finish.
    pub async fn shutdown(&self) {
        self.close_queues();
        self.tracker.close();
        info!(workers = self.tracker.len(), "draining dispatcher");
        self.tracker.wait().await;
        info!("dispatcher drained");
    }

    /// Stops accepting events and cancels workers between turns.
    ///
    /// A turn already in progress runs to completion; queued events are
    /// discarded.
    pub async fn abort(&self) {
        self.close_queues();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("dispatcher aborted");
    }

    fn close_queues(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.closed = true;
        // Dropping the senders lets each worker exit once its queue is empty.
        workers.queues.clear();
    }
}

impl<S: ScopeStore> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker<S: ScopeStore>(
    key: ScopeKey,
    mut rx: mpsc::UnboundedReceiver<ChatEvent>,
    processor: Arc<SessionProcessor<S>>,
    workers: Arc<Mutex<Workers>>,
    idle: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%key, "worker cancelled");
                break;
            }
            received = tokio::time::timeout(idle, rx.recv()) => received,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_elapsed) => match retire_or_take(&key, &mut rx, &workers) {
                Some(event) => event,
                None => {
                    debug!(%key, "worker idle; retiring");
                    return;
                }
            },
        };

        let conversation_id = event.conversation_id.clone();
        match processor.process(&conversation_id, event).await {
            Ok(outcome) => debug!(%key, ?outcome, "turn processed"),
            Err(report) => error!(%key, error = %report, "turn failed"),
        }
    }

    drop(rx);
    deregister(&key, &workers);
}

/// Removes the worker's queue if it is still empty.
///
/// Holding the map lock while checking the queue means no event can be sent
/// to this worker between the check and the removal. While the receiver is
/// alive the map entry for the key can only be this worker's own sender.
fn retire_or_take(
    key: &ScopeKey,
    rx: &mut mpsc::UnboundedReceiver<ChatEvent>,
    workers: &Mutex<Workers>,
) -> Option<ChatEvent> {
    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
    match rx.try_recv() {
        Ok(event) => Some(event),
        Err(_) => {
            workers.queues.remove(key);
            None
        }
    }
}

/// Removes a stale queue after its receiver has been dropped.
///
/// A replacement worker may already be registered under the key; its sender
/// is still open and is left alone.
fn deregister(key: &ScopeKey, workers: &Mutex<Workers>) {
    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
    if workers.queues.get(key).is_some_and(mpsc::UnboundedSender::is_closed) {
        workers.queues.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandHandler, handler_fn};
    use crate::error::HandlerError;
    use async_trait::async_trait;
    use chrono::Utc;
    use palaver_conversation::{
        DeliveryReceipt, MemoryScopeStore, MessageSender, OutgoingMessage, Scope, SendError,
    };
    use palaver_core::ConversationId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSender;

    #[async_trait]
    impl MessageSender for NullSender {
        async fn deliver(
            &self,
            conversation_id: &ConversationId,
            _message: OutgoingMessage,
        ) -> Result<DeliveryReceipt, Report<SendError>> {
            Ok(DeliveryReceipt {
                conversation_id: conversation_id.clone(),
                sequence: None,
                accepted_at: Utc::now(),
            })
        }
    }

    fn processor() -> Arc<SessionProcessor<MemoryScopeStore>> {
        Arc::new(SessionProcessor::new(
            MemoryScopeStore::new(),
            Arc::new(NullSender),
        ))
    }

    /// Records every text it sees into the scope data, in turn order.
    struct Collector;

    #[async_trait]
    impl CommandHandler for Collector {
        async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let text = scope.current_text().unwrap_or_default().to_string();
            let mut seen: Vec<String> = scope.data_as()?.unwrap_or_default();
            seen.push(text);
            scope.set_data(&seen)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn same_key_events_are_processed_in_arrival_order() {
        let processor = processor();
        processor.register(r"^/collect$", Collector).await.expect("register");
        let dispatcher = Dispatcher::new(Arc::clone(&processor), DispatcherConfig::default());

        dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "/collect"))
            .expect("dispatch");
        for i in 0..20 {
            dispatcher
                .dispatch(ChatEvent::text("c1", "alice", format!("{i}")))
                .expect("dispatch");
        }
        dispatcher.shutdown().await;

        let key = ScopeKey::new("c1".into(), "alice".into());
        let scope = processor.store().get(&key).await.expect("get").expect("scope");
        let seen: Vec<String> = scope.data_as().expect("decode").expect("data");

        let mut expected = vec!["/collect".to_string()];
        expected.extend((0..20).map(|i| i.to_string()));
        assert_eq!(seen, expected);
        assert_eq!(scope.history_len(), 21);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_keys_run_in_parallel() {
        struct Rendezvous {
            arrived: Arc<tokio::sync::Barrier>,
        }

        #[async_trait]
        impl CommandHandler for Rendezvous {
            async fn handle(&self, scope: &mut Scope) -> Result<(), HandlerError> {
                // Both turns must be in flight at once to pass the barrier.
                self.arrived.wait().await;
                scope.finish();
                Ok(())
            }
        }

        let processor = processor();
        processor
            .register(
                r"^/meet$",
                Rendezvous {
                    arrived: Arc::new(tokio::sync::Barrier::new(2)),
                },
            )
            .await
            .expect("register");
        let dispatcher = Dispatcher::new(processor, DispatcherConfig::default());

        dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "/meet"))
            .expect("dispatch");
        dispatcher
            .dispatch(ChatEvent::text("c1", "bob", "/meet"))
            .expect("dispatch");

        tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown())
            .await
            .expect("both keys made progress concurrently");
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_is_rejected() {
        let dispatcher = Dispatcher::new(processor(), DispatcherConfig::default());
        dispatcher.shutdown().await;

        let err = dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "/ping"))
            .unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }

    #[tokio::test]
    async fn failed_turn_does_not_stop_the_worker() {
        let processor = processor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        processor
            .register(
                r"^/flaky",
                handler_fn(move |scope| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if scope.current_text() == Some("/flaky fail") {
                        return Err(HandlerError::new("requested failure"));
                    }
                    scope.finish();
                    Ok(())
                }),
            )
            .await
            .expect("register");
        let dispatcher = Dispatcher::new(Arc::clone(&processor), DispatcherConfig::default());

        dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "/flaky fail"))
            .expect("dispatch");
        dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "/flaky ok"))
            .expect("dispatch");
        dispatcher.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(processor.store().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_retires_and_restarts() {
        let processor = processor();
        processor
            .register(r"^/collect$", Collector)
            .await
            .expect("register");
        let dispatcher = Dispatcher::new(
            Arc::clone(&processor),
            DispatcherConfig {
                worker_idle: Duration::from_secs(1),
            },
        );

        dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "/collect"))
            .expect("dispatch");
        assert_eq!(dispatcher.active_keys(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.active_keys(), 0);

        dispatcher
            .dispatch(ChatEvent::text("c1", "alice", "more"))
            .expect("dispatch");
        dispatcher.shutdown().await;

        let key = ScopeKey::new("c1".into(), "alice".into());
        let scope = processor.store().get(&key).await.expect("get").expect("scope");
        assert_eq!(scope.history_len(), 2);
    }

    #[tokio::test]
    async fn abort_discards_queued_events() {
        let processor = processor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        processor
            .register(
                r"^/count$",
                handler_fn(move |_scope| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await
            .expect("register");
        let dispatcher = Dispatcher::new(processor, DispatcherConfig::default());

        for _ in 0..50 {
            dispatcher
                .dispatch(ChatEvent::text("c1", "alice", "/count"))
                .expect("dispatch");
        }
        dispatcher.abort().await;

        assert!(calls.load(Ordering::SeqCst) < 50);
        assert!(dispatcher.dispatch(ChatEvent::text("c1", "alice", "/count")).is_err());
    }
}
