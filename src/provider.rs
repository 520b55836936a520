//! Provider: per-topic pub/sub with shared in-flight state.
//!
//! A `Provider<T,E>` is shared by reference among every controller of one
//! `(T,E)` family. It owns its listener map and shared-state map exclusively;
//! listeners are owned by the [`SubscriberHandle`] that installed them;
//! dropping the handle removes the listener (see the design's "cyclic
//! references" note).

use crate::key::hash_key;
use crate::state::{QueryState, StateMetadata};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Event published to a topic's listeners.
#[derive(Clone, Debug)]
pub enum ProviderEvent<T, E> {
    /// An accepted state transition, already rewritten to `origin: Provider`
    /// for every recipient except the publisher (which sees its own write
    /// only through the fan-out, per the design's ordering guarantees).
    Transition {
        state: QueryState<T, E>,
        metadata: StateMetadata,
    },
    /// A cache invalidation affecting this topic.
    Invalidation,
}

/// Settlement status of an [`ObservablePromise`], readable synchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Rejected,
}

struct PromiseInner<S> {
    status: PromiseStatus,
    value: Option<S>,
}

/// A shared, observable, single-flight handle on a value being computed.
///
/// Exposes `status()` synchronously (Pending/Fulfilled/Rejected) as the
/// design's "promise with observable status" note requires, plus an async
/// `join()` for callers that want to await settlement.
pub struct ObservablePromise<S: Clone + Send + Sync + 'static> {
    inner: Mutex<PromiseInner<S>>,
    notify: Notify,
}

impl<S: Clone + Send + Sync + 'static> ObservablePromise<S> {
    pub fn new() -> Arc<Self> {
        Arc::new(ObservablePromise {
            inner: Mutex::new(PromiseInner {
                status: PromiseStatus::Pending,
                value: None,
            }),
            notify: Notify::new(),
        })
    }

    pub fn status(&self) -> PromiseStatus {
        self.inner.lock().expect("promise mutex poisoned").status
    }

    pub fn is_settled(&self) -> bool {
        self.status() != PromiseStatus::Pending
    }

    /// Settle the promise. Idempotent: settling an already-settled promise
    /// is a no-op (the first settlement wins).
    pub fn settle(&self, status: PromiseStatus, value: S) {
        let mut guard = self.inner.lock().expect("promise mutex poisoned");
        if guard.status != PromiseStatus::Pending {
            return;
        }
        guard.status = status;
        guard.value = Some(value);
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Await settlement and return the settled value, joining in-flight
    /// work rather than launching new work.
    pub async fn join(&self) -> S {
        loop {
            {
                let guard = self.inner.lock().expect("promise mutex poisoned");
                if let Some(v) = guard.value.clone() {
                    return v;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Per-fingerprint shared state: the last known key and any in-flight fetch.
pub struct SharedTopicState<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    pub in_flight: tokio::sync::Mutex<Option<Arc<ObservablePromise<QueryState<T, E>>>>>,
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> SharedTopicState<T, E> {
    fn new() -> Self {
        SharedTopicState {
            in_flight: tokio::sync::Mutex::new(None),
        }
    }
}

/// A listener callback registered with a topic.
pub type Listener<T, E> =
    Arc<dyn Fn(ProviderEvent<T, E>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Topic<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    listeners: Vec<(u64, Listener<T, E>)>,
    state: Arc<SharedTopicState<T, E>>,
}

/// Per-topic listener set with shared per-topic state.
///
/// Invariant: state for a topic exists iff at least one subscriber exists.
/// `publish` to an unknown topic is a no-op.
pub struct Provider<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    topics: DashMap<String, Topic<T, E>>,
    next_listener_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> Default
    for Provider<T, E>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> Provider<T, E> {
    pub fn new() -> Self {
        Provider {
            topics: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Subscribe `listener` to `topic`. On first subscriber, installs fresh
    /// shared state; a subsequent subscriber on an already-live topic keeps
    /// the existing state. Returns the listener id, used to unsubscribe.
    pub fn subscribe(&self, topic: &str, listener: Listener<T, E>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                listeners: Vec::new(),
                state: Arc::new(SharedTopicState::new()),
            })
            .listeners
            .push((id, listener));
        id
    }

    /// Remove one listener from a topic. Drops the topic (and its state)
    /// once the listener set becomes empty.
    pub fn unsubscribe(&self, topic: &str, listener_id: u64) {
        let mut drop_topic = false;
        if let Some(mut entry) = self.topics.get_mut(topic) {
            entry.listeners.retain(|(id, _)| *id != listener_id);
            drop_topic = entry.listeners.is_empty();
        }
        if drop_topic {
            self.topics.remove(topic);
        }
    }

    /// Remove every listener from a topic and drop its state.
    pub fn unsubscribe_all(&self, topic: &str) {
        self.topics.remove(topic);
    }

    /// Deliver `event` to every listener on `topic` except those in `ignore`.
    /// The listener list is snapshotted before any listener runs, so a
    /// publish triggered from inside a listener cannot join the current
    /// delivery pass (it is deferred to its own, later pass).
    pub async fn publish(&self, topic: &str, event: ProviderEvent<T, E>, ignore: &[u64]) {
        let listeners: Vec<(u64, Listener<T, E>)> = match self.topics.get(topic) {
            Some(entry) => entry.listeners.clone(),
            None => return,
        };

        for (id, listener) in listeners {
            if ignore.contains(&id) {
                continue;
            }
            // Handler failures are isolated: a panicking future would abort
            // the whole publish loop, so handlers are expected to report
            // errors internally rather than panic; we still guard the
            // await itself against a rejected future by simply awaiting it
            // (errors inside the handler future are the handler's problem
            // to swallow, matching syncPromiseResolver's contract upstream).
            listener(event.clone()).await;
        }
    }

    /// Fetch the shared state for a topic, if it currently has subscribers.
    pub fn state(&self, topic: &str) -> Option<Arc<SharedTopicState<T, E>>> {
        self.topics.get(topic).map(|entry| entry.state.clone())
    }

    /// All currently-live topic fingerprints.
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// All topics whose fingerprint has `prefix` as a string prefix.
    ///
    /// Relies on [`hash_key`]'s prefix-preservation invariant: every topic
    /// fingerprint descending from a key tuple that has `prefix_key` as a
    /// tuple prefix will itself have `hash_key(prefix_key)` as a string
    /// prefix.
    pub fn topics_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.topics
            .iter()
            .map(|e| e.key().clone())
            .filter(|t| t.starts_with(prefix))
            .collect()
    }
}

/// Compute the provider topic for a key tuple (a thin wrapper over
/// [`hash_key`] kept here so callers only need one import for "what is this
/// key's topic").
pub fn topic_for<K: crate::key::KeyTuple>(key: &K) -> String {
    hash_key(key)
}

/// Binds one listener to one provider, transferring subscription between
/// topics and guaranteeing release on scope exit.
///
/// `unsubscribe()` is idempotent: calling it twice, or letting `Drop` run
/// after an explicit call, is a no-op the second time.
pub struct SubscriberHandle<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    provider: Arc<Provider<T, E>>,
    current: Mutex<Option<(String, u64)>>,
    listener: Listener<T, E>,
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> SubscriberHandle<T, E> {
    pub fn new(provider: Arc<Provider<T, E>>, listener: Listener<T, E>) -> Self {
        SubscriberHandle {
            provider,
            current: Mutex::new(None),
            listener,
        }
    }

    /// Transfer this handle's subscription to `topic` (or to none, if
    /// `topic` is `None`), unsubscribing from the prior topic first if it
    /// differs.
    pub fn use_topic(&self, topic: Option<&str>) {
        let mut current = self.current.lock().expect("subscriber mutex poisoned");
        if let Some((old_topic, old_id)) = current.as_ref() {
            if Some(old_topic.as_str()) == topic {
                return;
            }
            self.provider.unsubscribe(old_topic, *old_id);
        }
        *current = topic.map(|t| {
            let id = self.provider.subscribe(t, self.listener.clone());
            (t.to_string(), id)
        });
    }

    /// The topic this handle is currently subscribed to, if any.
    pub fn current_topic(&self) -> Option<String> {
        self.current
            .lock()
            .expect("subscriber mutex poisoned")
            .as_ref()
            .map(|(t, _)| t.clone())
    }

    /// Publish to the current topic, excluding this handle's own listener.
    pub async fn publish(&self, event: ProviderEvent<T, E>) {
        let current = self.current.lock().expect("subscriber mutex poisoned").clone();
        if let Some((topic, id)) = current {
            self.provider.publish(&topic, event, &[id]).await;
        }
    }

    /// Publish to an arbitrary topic, excluding this handle's own listener.
    pub async fn publish_topic(&self, topic: &str, event: ProviderEvent<T, E>) {
        let id = self
            .current
            .lock()
            .expect("subscriber mutex poisoned")
            .as_ref()
            .map(|(_, id)| *id)
            .unwrap_or(u64::MAX);
        self.provider.publish(topic, event, &[id]).await;
    }

    pub fn unsubscribe(&self) {
        self.use_topic(None);
    }
}

impl<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> Drop
    for SubscriberHandle<T, E>
{
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn noop_listener<T: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static>(
    ) -> Listener<T, E> {
        Arc::new(|_event| Box::pin(async {}))
    }

    #[test]
    fn test_state_absent_until_subscribed() {
        let provider: Provider<i32, String> = Provider::new();
        assert!(provider.state("topic").is_none());
        let id = provider.subscribe("topic", noop_listener());
        assert!(provider.state("topic").is_some());
        provider.unsubscribe("topic", id);
        assert!(provider.state("topic").is_none());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic_is_noop() {
        let provider: Provider<i32, String> = Provider::new();
        // Should not panic or do anything observable.
        provider
            .publish("nowhere", ProviderEvent::Invalidation, &[])
            .await;
    }

    #[tokio::test]
    async fn test_publish_delivers_in_subscription_order() {
        let provider: Provider<i32, String> = Provider::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            let listener: Listener<i32, String> = Arc::new(move |_event| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                })
            });
            provider.subscribe("topic", listener);
        }

        provider
            .publish("topic", ProviderEvent::Invalidation, &[])
            .await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_publish_respects_ignore_list() {
        let provider: Provider<i32, String> = Provider::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let listener: Listener<i32, String> = Arc::new(move |_event| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let id = provider.subscribe("topic", listener);

        provider
            .publish("topic", ProviderEvent::Invalidation, &[id])
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_observable_promise_join() {
        let promise: Arc<ObservablePromise<i32>> = ObservablePromise::new();
        assert_eq!(promise.status(), PromiseStatus::Pending);

        let p2 = promise.clone();
        let handle = tokio::spawn(async move { p2.join().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        promise.settle(PromiseStatus::Fulfilled, 42);

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(promise.status(), PromiseStatus::Fulfilled);
    }

    #[test]
    fn test_observable_promise_settle_is_idempotent() {
        let promise: Arc<ObservablePromise<i32>> = ObservablePromise::new();
        promise.settle(PromiseStatus::Fulfilled, 1);
        promise.settle(PromiseStatus::Rejected, 2);
        assert_eq!(promise.status(), PromiseStatus::Fulfilled);
    }

    #[test]
    fn test_subscriber_handle_transfers_topic() {
        let provider = Arc::new(Provider::<i32, String>::new());
        let handle = SubscriberHandle::new(provider.clone(), noop_listener());

        handle.use_topic(Some("a"));
        assert!(provider.state("a").is_some());

        handle.use_topic(Some("b"));
        assert!(provider.state("a").is_none());
        assert!(provider.state("b").is_some());
    }

    #[test]
    fn test_subscriber_handle_unsubscribe_idempotent() {
        let provider = Arc::new(Provider::<i32, String>::new());
        let handle = SubscriberHandle::new(provider.clone(), noop_listener());
        handle.use_topic(Some("a"));
        handle.unsubscribe();
        handle.unsubscribe();
        assert!(provider.state("a").is_none());
    }

    #[test]
    fn test_subscriber_handle_drop_unsubscribes() {
        let provider = Arc::new(Provider::<i32, String>::new());
        {
            let handle = SubscriberHandle::new(provider.clone(), noop_listener());
            handle.use_topic(Some("a"));
            assert!(provider.state("a").is_some());
        }
        assert!(provider.state("a").is_none());
    }

    #[test]
    fn test_topics_with_prefix() {
        let provider: Provider<i32, String> = Provider::new();
        provider.subscribe("a:u:1", noop_listener());
        provider.subscribe("a:u:2", noop_listener());
        provider.subscribe("a:o:1", noop_listener());

        let mut matching = provider.topics_with_prefix("a:u");
        matching.sort();
        assert_eq!(matching, vec!["a:u:1".to_string(), "a:u:2".to_string()]);
    }
}
