//! NATS adapters.
//!
//! - Inbound chat events: core subscription on `events_subject`
//! - Scopes: JetStream key-value bucket whose `max_age` is the scope TTL
//! - Outbound messages: JetStream stream on `outbound_subject`
//! - Request acceptance: core publish on `control_subject`

use crate::error::TransportError;
use crate::ingress::RequestAcceptor;
use async_nats::jetstream::context::{KeyValueError, KeyValueErrorKind};
use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use futures::{Stream, StreamExt, future};
use palaver_conversation::{
    ChatEvent, DeliveryReceipt, MessageSender, OutgoingMessage, Scope, ScopeStore, SendError,
    StoreError, decode_scope, encode_scope,
};
use palaver_core::{ConversationId, EventId, ParticipantId, ScopeKey};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default server URL.
const DEFAULT_URL: &str = "nats://localhost:4222";

/// Default subject for inbound chat events.
const DEFAULT_EVENTS_SUBJECT: &str = "chat.events.>";

/// Default stream name for outbound messages.
const DEFAULT_OUTBOUND_STREAM: &str = "CHAT_OUTBOUND";

/// Default subject for outbound messages.
const DEFAULT_OUTBOUND_SUBJECT: &str = "chat.outbound";

/// Default subject for control messages such as request acceptance.
const DEFAULT_CONTROL_SUBJECT: &str = "chat.control";

/// Default key-value bucket for scopes.
const DEFAULT_SCOPE_BUCKET: &str = "chat-scopes";

/// Client name reported to the server.
const CLIENT_NAME: &str = "palaver";

/// Configuration for the NATS adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL.
    pub url: String,
    /// Subject (wildcards allowed) carrying inbound chat events.
    pub events_subject: String,
    /// JetStream stream capturing outbound messages.
    pub outbound_stream: String,
    /// Subject outbound messages are published on.
    pub outbound_subject: String,
    /// Subject control messages are published on.
    pub control_subject: String,
    /// Key-value bucket holding scopes.
    pub scope_bucket: String,
    /// Reconnect attempts before giving up; unlimited when unset.
    pub max_reconnects: Option<usize>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            events_subject: DEFAULT_EVENTS_SUBJECT.to_string(),
            outbound_stream: DEFAULT_OUTBOUND_STREAM.to_string(),
            outbound_subject: DEFAULT_OUTBOUND_SUBJECT.to_string(),
            control_subject: DEFAULT_CONTROL_SUBJECT.to_string(),
            scope_bucket: DEFAULT_SCOPE_BUCKET.to_string(),
            max_reconnects: None,
        }
    }
}

impl NatsConfig {
    /// Creates a config for the given server URL with default names.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Connects to the server, logging connection lifecycle events.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] if the initial connection fails.
pub async fn connect(config: &NatsConfig) -> Result<Client, Report<TransportError>> {
    info!(url = %config.url, "connecting to NATS");

    let client = ConnectOptions::new()
        .name(CLIENT_NAME)
        .max_reconnects(config.max_reconnects)
        .event_callback(|event| async move { log_event(&event) })
        .connect(config.url.as_str())
        .await
        .map_err(|e| TransportError::Connect {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

    Ok(client)
}

fn log_event(event: &Event) {
    match event {
        Event::Connected => info!("NATS connection established"),
        Event::Disconnected => warn!("NATS connection lost; reconnecting"),
        Event::LameDuckMode => warn!("NATS server entered lame duck mode"),
        Event::SlowConsumer(sid) => warn!(subscription = sid, "NATS slow consumer"),
        other => info!(event = %other, "NATS client event"),
    }
}

/// Subscribes to inbound chat events.
///
/// Payloads that do not decode as a [`ChatEvent`] are logged and skipped.
///
/// # Errors
///
/// Returns [`TransportError::Subscribe`] if the subscription is refused.
pub async fn chat_events(
    client: &Client,
    subject: &str,
) -> Result<impl Stream<Item = ChatEvent> + Send + Unpin + 'static, Report<TransportError>> {
    let subscriber = client
        .subscribe(subject.to_string())
        .await
        .map_err(|e| TransportError::Subscribe {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

    info!(subject, "subscribed to chat events");
    Ok(subscriber
        .filter_map(|message| future::ready(decode_event(&message.subject, &message.payload))))
}

fn decode_event(subject: &str, payload: &[u8]) -> Option<ChatEvent> {
    match serde_json::from_slice(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(subject, error = %e, "skipping undecodable chat event");
            None
        }
    }
}

/// Returns the bucket key for a scope key.
///
/// Bucket keys may not contain `:`, so the `conversation:participant` form is
/// stored base64url-encoded without padding.
#[must_use]
pub fn bucket_key(key: &ScopeKey) -> String {
    URL_SAFE_NO_PAD.encode(key.storage_key())
}

/// Scope store backed by a JetStream key-value bucket.
///
/// Expiry is enforced by the bucket's `max_age`; every put writes a new
/// revision, which restarts the clock for that key. After [`ScopeStore::close`]
/// every operation fails with [`StoreError::Closed`]; the bucket itself is
/// left in place.
pub struct NatsScopeStore {
    kv: kv::Store,
    ttl: Duration,
    closed: AtomicBool,
}

impl NatsScopeStore {
    /// Opens the bucket, creating it with `ttl` as its `max_age` if needed.
    ///
    /// An existing bucket keeps the `max_age` it was created with. Only a
    /// failed bucket lookup leads to creation; an invalid bucket name or a
    /// JetStream error is returned as is.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Setup`] if the bucket cannot be opened or created.
    pub async fn open(
        client: Client,
        bucket: &str,
        ttl: Duration,
    ) -> Result<Self, Report<TransportError>> {
        let jetstream = jetstream::new(client);

        let kv = match jetstream.get_key_value(bucket).await {
            Ok(kv) => {
                debug!(bucket, "opened existing scope bucket");
                kv
            }
            Err(lookup) if creates_bucket(lookup.kind()) => {
                info!(bucket, error = %lookup, "scope bucket not found; creating it");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        description: "palaver session scopes".to_string(),
                        history: 1,
                        max_age: ttl,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| bucket_setup_error(bucket, &lookup, &e))?
            }
            Err(lookup) => {
                return Err(TransportError::Setup {
                    resource: format!("bucket {bucket}"),
                    reason: lookup.to_string(),
                }
                .into());
            }
        };

        info!(bucket, ttl_seconds = ttl.as_secs(), "scope bucket ready");
        Ok(Self {
            kv,
            ttl,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the TTL the bucket was requested with.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Whether a failed bucket lookup means the bucket should be created.
fn creates_bucket(kind: KeyValueErrorKind) -> bool {
    matches!(kind, KeyValueErrorKind::GetBucket)
}

fn bucket_setup_error(
    bucket: &str,
    lookup: &KeyValueError,
    create: &dyn std::fmt::Display,
) -> TransportError {
    TransportError::Setup {
        resource: format!("bucket {bucket}"),
        reason: format!("lookup failed ({lookup}); create failed ({create})"),
    }
}

fn ensure_open(closed: &AtomicBool) -> Result<(), Report<StoreError>> {
    if closed.load(Ordering::Acquire) {
        return Err(StoreError::Closed.into());
    }
    Ok(())
}

#[async_trait]
impl ScopeStore for NatsScopeStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &ScopeKey) -> Result<Option<Scope>, Report<StoreError>> {
        ensure_open(&self.closed)?;
        let entry = self
            .kv
            .get(bucket_key(key))
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })?;

        entry.map(|bytes| decode_scope(key, &bytes)).transpose()
    }

    #[instrument(skip(self, scope), fields(key = %scope.key()))]
    async fn put(&self, scope: &Scope) -> Result<(), Report<StoreError>> {
        ensure_open(&self.closed)?;
        let bytes = encode_scope(scope)?;
        let revision = self
            .kv
            .put(bucket_key(scope.key()), bytes.into())
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })?;

        debug!(revision, "scope stored");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &ScopeKey) -> Result<(), Report<StoreError>> {
        ensure_open(&self.closed)?;
        self.kv
            .delete(bucket_key(key))
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn close(&self) -> Result<(), Report<StoreError>> {
        self.closed.store(true, Ordering::Release);
        info!(bucket = %self.kv.name, "scope store closed");
        Ok(())
    }
}

/// Wire form of an outbound message.
#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    conversation_id: &'a ConversationId,
    #[serde(flatten)]
    message: &'a OutgoingMessage,
}

fn encode_outbound(
    conversation_id: &ConversationId,
    message: &OutgoingMessage,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&OutboundEnvelope {
        conversation_id,
        message,
    })
}

/// Message sender publishing to a JetStream stream.
///
/// The stream's publish acknowledgment is the delivery receipt.
pub struct NatsMessageSender {
    jetstream: jetstream::Context,
    subject: String,
}

impl NatsMessageSender {
    /// Creates the sender, ensuring the outbound stream exists.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Setup`] if the stream cannot be created.
    pub async fn new(client: Client, config: &NatsConfig) -> Result<Self, Report<TransportError>> {
        let jetstream = jetstream::new(client);
        Self::ensure_stream(&jetstream, config).await?;

        Ok(Self {
            jetstream,
            subject: config.outbound_subject.clone(),
        })
    }

    async fn ensure_stream(
        jetstream: &jetstream::Context,
        config: &NatsConfig,
    ) -> Result<(), Report<TransportError>> {
        let stream_config = jetstream::stream::Config {
            name: config.outbound_stream.clone(),
            subjects: vec![config.outbound_subject.clone()],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| TransportError::Setup {
                resource: format!("stream {}", config.outbound_stream),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl MessageSender for NatsMessageSender {
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        message: OutgoingMessage,
    ) -> Result<DeliveryReceipt, Report<SendError>> {
        let bytes =
            encode_outbound(conversation_id, &message).map_err(|e| SendError::DeliveryFailed {
                reason: format!("failed to serialize message: {e}"),
            })?;

        let ack = self
            .jetstream
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| SendError::DeliveryFailed {
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| SendError::DeliveryFailed {
                reason: e.to_string(),
            })?;

        debug!(%conversation_id, sequence = ack.sequence, "message accepted");
        Ok(DeliveryReceipt {
            conversation_id: conversation_id.clone(),
            sequence: Some(ack.sequence),
            accepted_at: Utc::now(),
        })
    }
}

/// Wire form of a control message.
#[derive(Debug, Serialize)]
struct ControlMessage<'a> {
    action: &'static str,
    conversation_id: &'a ConversationId,
    participant: &'a ParticipantId,
    reference: &'a EventId,
}

fn encode_accept(request: &ChatEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&ControlMessage {
        action: "accept",
        conversation_id: &request.conversation_id,
        participant: &request.from,
        reference: &request.id,
    })
}

/// Accepts participation requests by publishing a control message.
pub struct NatsRequestAcceptor {
    client: Client,
    subject: String,
}

impl NatsRequestAcceptor {
    /// Creates an acceptor publishing on the configured control subject.
    #[must_use]
    pub fn new(client: Client, config: &NatsConfig) -> Self {
        Self {
            client,
            subject: config.control_subject.clone(),
        }
    }
}

#[async_trait]
impl RequestAcceptor for NatsRequestAcceptor {
    async fn accept(&self, request: &ChatEvent) -> Result<(), Report<SendError>> {
        let bytes = encode_accept(request).map_err(|e| SendError::DeliveryFailed {
            reason: format!("failed to serialize accept: {e}"),
        })?;

        self.client
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| SendError::DeliveryFailed {
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_conversation::{EventBody, EventKind};
    use serde_json::json;

    #[test]
    fn config_defaults_apply_to_missing_fields() {
        let config: NatsConfig =
            serde_json::from_value(json!({ "url": "nats://nats.internal:4222" }))
                .expect("decode config");

        assert_eq!(config.url, "nats://nats.internal:4222");
        assert_eq!(config.events_subject, "chat.events.>");
        assert_eq!(config.outbound_stream, "CHAT_OUTBOUND");
        assert_eq!(config.scope_bucket, "chat-scopes");
        assert_eq!(config.max_reconnects, None);
        assert_eq!(NatsConfig::new("nats://nats.internal:4222"), config);
    }

    #[test]
    fn only_missing_buckets_are_created() {
        assert!(creates_bucket(KeyValueErrorKind::GetBucket));
        assert!(!creates_bucket(KeyValueErrorKind::InvalidStoreName));
        assert!(!creates_bucket(KeyValueErrorKind::JetStream));
    }

    #[test]
    fn bucket_setup_error_keeps_lookup_cause() {
        let lookup = KeyValueError::from(KeyValueErrorKind::GetBucket);
        let err = bucket_setup_error("chat-scopes", &lookup, &"permission denied");
        let message = err.to_string();

        assert!(message.contains("chat-scopes"));
        assert!(message.contains("failed to get the bucket"));
        assert!(message.contains("permission denied"));
    }

    #[test]
    fn closed_flag_rejects_operations() {
        let closed = AtomicBool::new(false);
        assert!(ensure_open(&closed).is_ok());

        closed.store(true, Ordering::Release);
        let err = ensure_open(&closed).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn bucket_key_avoids_reserved_characters() {
        let key = ScopeKey::new("room:42".into(), "alice@example.org".into());
        let encoded = bucket_key(&key);

        assert!(
            encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        let decoded = URL_SAFE_NO_PAD.decode(&encoded).expect("base64");
        assert_eq!(decoded, b"room:42:alice@example.org");
    }

    #[test]
    fn bucket_keys_differ_per_participant() {
        let alice = ScopeKey::new("c1".into(), "alice".into());
        let bob = ScopeKey::new("c1".into(), "bob".into());
        assert_ne!(bucket_key(&alice), bucket_key(&bob));
    }

    #[test]
    fn decode_event_reads_wire_json() {
        let payload = json!({
            "id": "evt-1",
            "origin": "other",
            "timestamp": "2024-05-01T12:00:00Z",
            "conversation_id": "c1",
            "from": "alice",
            "kind": "message",
            "payload": { "type": "text", "content": "/ping" }
        });
        let bytes = serde_json::to_vec(&payload).expect("encode");

        let event = decode_event("chat.events.c1", &bytes).expect("decoded");
        assert_eq!(event.kind(), EventKind::Message);
        assert_eq!(event.text_content(), Some("/ping"));
    }

    #[test]
    fn decode_event_skips_garbage() {
        assert!(decode_event("chat.events.c1", b"not json").is_none());
        assert!(decode_event("chat.events.c1", br#"{"kind":"message"}"#).is_none());
    }

    #[test]
    fn outbound_envelope_carries_conversation() {
        let message = OutgoingMessage::text("Pong!").in_reply_to(EventId::new("evt-1"));
        let bytes = encode_outbound(&ConversationId::new("c1"), &message).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

        assert_eq!(value["conversation_id"], "c1");
        assert_eq!(value["payload"]["content"], "Pong!");
        assert_eq!(value["reply_to"], "evt-1");
    }

    #[test]
    fn accept_references_the_request() {
        let request = ChatEvent::new(
            "c1".into(),
            "alice".into(),
            EventBody::Request {
                to: None,
                payload: None,
            },
        )
        .with_id("req-7");

        let value: serde_json::Value =
            serde_json::from_slice(&encode_accept(&request).expect("encode")).expect("json");
        assert_eq!(value["action"], "accept");
        assert_eq!(value["conversation_id"], "c1");
        assert_eq!(value["participant"], "alice");
        assert_eq!(value["reference"], "req-7");
    }
}
