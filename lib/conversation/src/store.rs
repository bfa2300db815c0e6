//! Scope storage.
//!
//! Scopes are stored under `conversationId:fromParticipant` as serialized
//! JSON with a time-to-live that is refreshed on every write. Expiry belongs
//! to the backend: a scope that has outlived its TTL reads as absent.

use crate::error::StoreError;
use crate::scope::Scope;
use async_trait::async_trait;
use palaver_core::ScopeKey;
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default scope time-to-live: one hour.
pub const DEFAULT_SCOPE_TTL: Duration = Duration::from_secs(3600);

/// Trait for TTL-bounded scope storage.
///
/// Implementations must make `put`, `get` and `delete` atomic per key.
/// Nothing more is required: callers serialize access to each key.
#[async_trait]
pub trait ScopeStore: Send + Sync + 'static {
    /// Loads the scope for a key.
    ///
    /// Returns `Ok(None)` if no scope is stored or it has expired.
    async fn get(&self, key: &ScopeKey) -> Result<Option<Scope>, Report<StoreError>>;

    /// Stores a scope under its key, refreshing its TTL.
    async fn put(&self, scope: &Scope) -> Result<(), Report<StoreError>>;

    /// Removes the scope for a key. Removing an absent key is not an error.
    async fn delete(&self, key: &ScopeKey) -> Result<(), Report<StoreError>>;

    /// Releases backend resources. Operations after close fail.
    async fn close(&self) -> Result<(), Report<StoreError>> {
        Ok(())
    }
}

/// Encodes a scope into its persisted form.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if the handler data cannot be serialized.
pub fn encode_scope(scope: &Scope) -> Result<Vec<u8>, Report<StoreError>> {
    serde_json::to_vec(scope).map_err(|e| {
        StoreError::Encode {
            key: scope.key().storage_key(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Decodes a persisted scope.
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if the bytes are not a valid scope.
pub fn decode_scope(key: &ScopeKey, bytes: &[u8]) -> Result<Scope, Report<StoreError>> {
    serde_json::from_slice(bytes).map_err(|e| {
        StoreError::Decode {
            key: key.storage_key(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[derive(Debug, Clone)]
struct StoredScope {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredScope {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process scope store.
///
/// Values are kept serialized so every read yields an independent copy, the
/// same as a remote backend would. Expiry uses the tokio clock, so paused-time
/// tests can advance past the TTL.
#[derive(Debug, Clone)]
pub struct MemoryScopeStore {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, StoredScope>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryScopeStore {
    /// Opens an empty store with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SCOPE_TTL)
    }

    /// Opens an empty store with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the number of unexpired scopes.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Returns true if no unexpired scopes are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    fn ensure_open(&self) -> Result<(), Report<StoreError>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }
}

impl Default for MemoryScopeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScopeStore for MemoryScopeStore {
    async fn get(&self, key: &ScopeKey) -> Result<Option<Scope>, Report<StoreError>> {
        self.ensure_open()?;
        let storage_key = key.storage_key();
        let now = Instant::now();

        {
            let entries = self.entries.read().await;
            match entries.get(&storage_key) {
                Some(entry) if entry.is_live(now) => {
                    return decode_scope(key, &entry.bytes).map(Some);
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it unless a concurrent put refreshed it meanwhile.
        let mut entries = self.entries.write().await;
        if entries
            .get(&storage_key)
            .is_some_and(|entry| !entry.is_live(Instant::now()))
        {
            entries.remove(&storage_key);
        }
        Ok(None)
    }

    async fn put(&self, scope: &Scope) -> Result<(), Report<StoreError>> {
        self.ensure_open()?;
        let bytes = encode_scope(scope)?;
        let entry = StoredScope {
            bytes,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .write()
            .await
            .insert(scope.key().storage_key(), entry);
        Ok(())
    }

    async fn delete(&self, key: &ScopeKey) -> Result<(), Report<StoreError>> {
        self.ensure_open()?;
        self.entries.write().await.remove(&key.storage_key());
        Ok(())
    }

    async fn close(&self) -> Result<(), Report<StoreError>> {
        self.closed.store(true, Ordering::Release);
        self.entries.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChatEvent;

    fn scope_for(conversation: &str, participant: &str) -> Scope {
        let key = ScopeKey::new(conversation.into(), participant.into());
        Scope::start(key, ChatEvent::text(conversation, participant, "/survey"))
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let store = MemoryScopeStore::new();
        let key = ScopeKey::new("c1".into(), "alice".into());
        assert!(store.get(&key).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn put_then_get_returns_independent_copy() {
        let store = MemoryScopeStore::new();
        let mut scope = scope_for("c1", "alice");
        store.put(&scope).await.expect("put");

        scope.record(ChatEvent::text("c1", "alice", "later"));

        let loaded = store.get(scope.key()).await.expect("get").expect("present");
        assert_eq!(loaded.history_len(), 1);
    }

    #[tokio::test]
    async fn put_upserts_by_key() {
        let store = MemoryScopeStore::new();
        let mut scope = scope_for("c1", "alice");
        store.put(&scope).await.expect("put");

        scope.record(ChatEvent::text("c1", "alice", "second"));
        store.put(&scope).await.expect("put");

        assert_eq!(store.len().await, 1);
        let loaded = store.get(scope.key()).await.expect("get").expect("present");
        assert_eq!(loaded.history_len(), 2);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryScopeStore::new();
        let scope = scope_for("c1", "alice");
        store.put(&scope).await.expect("put");

        store.delete(scope.key()).await.expect("delete");
        store.delete(scope.key()).await.expect("delete again");

        assert!(store.get(scope.key()).await.expect("get").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scope_expires_after_ttl() {
        let store = MemoryScopeStore::with_ttl(Duration::from_secs(60));
        let scope = scope_for("c1", "alice");
        store.put(&scope).await.expect("put");

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.get(scope.key()).await.expect("get").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(scope.key()).await.expect("get").is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn put_refreshes_ttl() {
        let store = MemoryScopeStore::with_ttl(Duration::from_secs(60));
        let scope = scope_for("c1", "alice");
        store.put(&scope).await.expect("put");

        tokio::time::advance(Duration::from_secs(45)).await;
        store.put(&scope).await.expect("refresh");

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.get(scope.key()).await.expect("get").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let store = MemoryScopeStore::with_ttl(Duration::from_secs(10));
        store.put(&scope_for("c1", "alice")).await.expect("put");

        tokio::time::advance(Duration::from_secs(11)).await;
        store.put(&scope_for("c1", "bob")).await.expect("put");

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = MemoryScopeStore::new();
        let scope = scope_for("c1", "alice");
        store.close().await.expect("close");

        let err = store.put(&scope).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        assert!(store.get(scope.key()).await.is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        let key = ScopeKey::new("c1".into(), "alice".into());
        let err = decode_scope(&key, b"not json").unwrap_err();
        assert!(err.to_string().contains("c1:alice"));
    }
}
