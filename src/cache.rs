//! Typed cache manager: serialization envelope + backend + provider fan-out.
//!
//! `CacheManager<B, V, E>` is the seam between a byte-oriented
//! [`crate::backend::CacheBackend`] and the typed `QueryState<V, E>` world
//! the controllers live in. Every store failure (serialization, backend,
//! corrupted envelope) is caught and logged here and never surfaces past
//! this module; callers see `None`/`()`, never an `Err`.

use crate::backend::CacheBackend;
use crate::key::{hash_key, KeyTuple};
use crate::provider::{Provider, ProviderEvent};
use crate::serialization::{deserialize_from_cache, serialize_for_cache};
use crate::state::{QueryState, Source, StateMetadata};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What was actually stored for one key: the value plus enough timing
/// information to recover `remaining_ttl` on a later `get_entry`.
#[derive(Serialize, Deserialize)]
struct StoredValue<V> {
    data: V,
    stored_at_ms: u64,
    ttl_ms: Option<u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cache hit, with the bookkeeping needed to judge freshness.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub data: V,
    /// The TTL the entry was stored with, if any.
    pub ttl: Option<Duration>,
    /// Time remaining until expiry, `None` if the entry has no TTL.
    pub remaining_ttl: Option<Duration>,
    /// Elapsed time since the entry was stored (`ttl - remaining_ttl` in the
    /// design's terms). Compared against a controller's `fresh` window,
    /// independent of the backend's own TTL expiry.
    pub age: Duration,
}

impl<V> CacheEntry<V> {
    /// The TTL this entry was stored with (an alias for `self.ttl`, kept for
    /// parity with the design's `duration()` accessor).
    pub fn duration(&self) -> Option<Duration> {
        self.ttl
    }

    /// Whether this entry's age is within `window` (the controller's `fresh`
    /// setting). An entry with no TTL is still subject to this check: it
    /// ages like any other entry, it simply never expires outright.
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.age < window
    }
}

/// Typed façade over a [`CacheBackend`], fanning out writes and
/// invalidations to a shared [`Provider`] so every live controller sees
/// cache-originated transitions without polling.
pub struct CacheManager<B, V, E>
where
    B: CacheBackend,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    backend: B,
    provider: Arc<Provider<V, E>>,
}

impl<B, V, E> CacheManager<B, V, E>
where
    B: CacheBackend,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(backend: B, provider: Arc<Provider<V, E>>) -> Self {
        CacheManager { backend, provider }
    }

    /// The shared provider this manager publishes through.
    pub fn provider(&self) -> &Arc<Provider<V, E>> {
        &self.provider
    }

    fn topic<K: KeyTuple>(key: &K) -> String {
        hash_key(key)
    }

    /// Fetch and deserialize a cached value, swallowing any backend or
    /// envelope error as a cache miss (logged at `warn!`).
    pub async fn get<K: KeyTuple>(&self, key: &K) -> Option<V> {
        self.get_entry(key).await.map(|entry| entry.data)
    }

    /// Fetch a cached value along with its TTL bookkeeping.
    pub async fn get_entry<K: KeyTuple>(&self, key: &K) -> Option<CacheEntry<V>> {
        let topic = Self::topic(key);
        let bytes = match self.backend.get(&topic).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("cache get({topic}) failed: {err}");
                return None;
            }
        };

        let stored: StoredValue<V> = match deserialize_from_cache(&bytes) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("cache entry at {topic} failed to deserialize: {err}");
                return None;
            }
        };

        let ttl = stored.ttl_ms.map(Duration::from_millis);
        let age_ms = now_ms().saturating_sub(stored.stored_at_ms);
        let age = Duration::from_millis(age_ms);
        let remaining_ttl = stored
            .ttl_ms
            .map(|ttl_ms| Duration::from_millis(ttl_ms.saturating_sub(age_ms)));

        Some(CacheEntry {
            data: stored.data,
            ttl,
            remaining_ttl,
            age,
        })
    }

    /// Serialize and persist `value` under `key`'s topic. Returns the topic,
    /// shared by `set` (which publishes afterwards) and `set_silent` (which
    /// doesn't).
    async fn store_bytes<K: KeyTuple>(&self, key: &K, value: &V, ttl: Option<Duration>) -> String {
        let topic = Self::topic(key);
        let stored = StoredValue {
            data: value.clone(),
            stored_at_ms: now_ms(),
            ttl_ms: ttl.map(|d| d.as_millis() as u64),
        };

        match serialize_for_cache(&stored) {
            Ok(bytes) => {
                if let Err(err) = self.backend.set(&topic, bytes, ttl).await {
                    log::warn!("cache set({topic}) failed: {err}");
                }
            }
            Err(err) => {
                log::warn!("cache set({topic}) failed to serialize: {err}");
            }
        }
        topic
    }

    /// Store a value and publish a `Success` transition for its topic.
    ///
    /// Store failures are logged and swallowed; the provider fan-out still
    /// happens, since the write intent succeeded from the caller's point of
    /// view even if the cache layer rejected the bytes. This is the path a
    /// mutation handler uses to propagate a write into every query watching
    /// the same key.
    pub async fn set<K: KeyTuple>(&self, key: &K, value: V, ttl: Option<Duration>) {
        let topic = self.store_bytes(key, &value, ttl).await;
        let metadata = StateMetadata::new(crate::state::Origin::Provider, Source::Mutation, None);
        self.provider
            .publish(
                &topic,
                ProviderEvent::Transition {
                    state: QueryState::Success { data: value },
                    metadata,
                },
                &[],
            )
            .await;
    }

    /// Persist a value without publishing a provider event.
    ///
    /// `QueryCore` uses this for the cache write that follows one of its own
    /// successful fetches: its `emit` already fans that transition out to
    /// every other subscriber on the topic (and dispatches locally), so
    /// publishing here too would deliver the same transition to every
    /// subscriber a second time.
    pub(crate) async fn set_silent<K: KeyTuple>(&self, key: &K, value: V, ttl: Option<Duration>) {
        self.store_bytes(key, &value, ttl).await;
    }

    /// Delete one key. No event is published: only `invalidate` publishes
    /// invalidation events (the manager is their sole publisher, and `delete`
    /// is not one of them per the operation table).
    pub async fn delete<K: KeyTuple>(&self, key: &K) {
        let topic = Self::topic(key);
        if let Err(err) = self.backend.delete(&topic).await {
            log::warn!("cache delete({topic}) failed: {err}");
        }
    }

    /// Delete every key with `prefix` as a tuple prefix and publish an
    /// invalidation to every live topic under that prefix.
    ///
    /// Relies on `hash_key`'s prefix-preservation: the backend's
    /// string-prefix delete and the provider's string-prefix topic scan
    /// agree on exactly the same set of keys.
    pub async fn invalidate<K: KeyTuple>(&self, prefix: &K) {
        let prefix_hash = Self::topic(prefix);
        if let Err(err) = self.backend.delete_prefix(&prefix_hash).await {
            log::warn!("cache invalidate({prefix_hash}) failed: {err}");
        }
        for topic in self.provider.topics_with_prefix(&prefix_hash) {
            self.provider
                .publish(&topic, ProviderEvent::Invalidation, &[])
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn key(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn manager() -> CacheManager<InMemoryBackend, String, String> {
        CacheManager::new(InMemoryBackend::new(), Arc::new(Provider::new()))
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrips() {
        let cache = manager();
        let k = key(&["user", "1"]);
        cache.set(&k, "alice".to_string(), None).await;
        assert_eq!(cache.get(&k).await, Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_get_miss_returns_none() {
        let cache = manager();
        let k = key(&["user", "missing"]);
        assert_eq!(cache.get(&k).await, None);
    }

    #[tokio::test]
    async fn test_get_entry_reports_ttl() {
        let cache = manager();
        let k = key(&["user", "1"]);
        cache
            .set(&k, "alice".to_string(), Some(Duration::from_secs(60)))
            .await;
        let entry = cache.get_entry(&k).await.expect("entry should exist");
        assert_eq!(entry.ttl, Some(Duration::from_secs(60)));
        assert!(entry.is_fresh(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let cache = manager();
        let k = key(&["user", "1"]);
        cache.set(&k, "alice".to_string(), None).await;
        cache.delete(&k).await;
        assert_eq!(cache.get(&k).await, None);
    }

    #[tokio::test]
    async fn test_invalidate_prefix_removes_matching_keys_only() {
        let cache = manager();
        cache.set(&key(&["a", "u", "1"]), "x".to_string(), None).await;
        cache.set(&key(&["a", "u", "2"]), "y".to_string(), None).await;
        cache.set(&key(&["a", "o", "1"]), "z".to_string(), None).await;

        cache.invalidate(&key(&["a", "u"])).await;

        assert_eq!(cache.get(&key(&["a", "u", "1"])).await, None);
        assert_eq!(cache.get(&key(&["a", "u", "2"])).await, None);
        assert_eq!(
            cache.get(&key(&["a", "o", "1"])).await,
            Some("z".to_string())
        );
    }

    #[tokio::test]
    async fn test_set_publishes_success_to_subscribers() {
        use crate::provider::SubscriberHandle;
        use std::sync::Mutex;

        let cache = manager();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let listener: crate::provider::Listener<String, String> = Arc::new(move |event| {
            let received = received_clone.clone();
            Box::pin(async move {
                if let ProviderEvent::Transition { state, .. } = event {
                    received.lock().unwrap().push(state.data().cloned());
                }
            })
        });

        let handle = SubscriberHandle::new(cache.provider().clone(), listener);
        let k = key(&["user", "1"]);
        handle.use_topic(Some(&hash_key(&k)));

        cache.set(&k, "alice".to_string(), None).await;

        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[Some("alice".to_string())]
        );
    }
}
