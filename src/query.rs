//! QueryCore: the cache-directive state machine, single-flight coordination,
//! retry loop, and handler dispatch for read operations.

use crate::backend::CacheBackend;
use crate::cache::CacheManager;
use crate::key::{KeyHasher, KeyTuple};
use crate::provider::{
    topic_for, Listener, ObservablePromise, Provider, ProviderEvent, PromiseStatus,
    SharedTopicState, SubscriberHandle,
};
use crate::retry::{exec_async_operation, NoRetryPolicy, RetryPolicy};
use crate::stats::{ControllerStats, StatsSnapshot};
use crate::state::{CacheDirective, Origin, QueryState, Source, StateMetadata};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Result type returned by a user handler: `Err` is logged and swallowed,
/// matching the design's handler-error isolation (§4.8/§7).
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A cooperative cancellation token passed to user fetch functions.
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        AbortSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub type QueryFn<K, T, E> = Arc<dyn Fn(K, AbortSignal) -> BoxFut<Result<T, E>> + Send + Sync>;
pub type FilterFn<T, E> =
    Arc<dyn Fn(&QueryState<T, E>, &QueryState<T, E>, &StateMetadata) -> bool + Send + Sync>;
pub type StateFn<T, E> =
    Arc<dyn Fn(QueryState<T, E>, StateMetadata) -> BoxFut<HandlerResult> + Send + Sync>;
pub type DataFn<T> = Arc<dyn Fn(T, StateMetadata) -> BoxFut<HandlerResult> + Send + Sync>;
pub type ErrorFn<E> = Arc<dyn Fn(E, StateMetadata) -> BoxFut<HandlerResult> + Send + Sync>;
pub type KeepCacheOnErrorFn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
pub type ExtractTtlFn<T> = Arc<dyn Fn(&T) -> Option<Duration> + Send + Sync>;
pub type RetryHandleFn<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;

async fn isolate_handler_error(fut: BoxFut<HandlerResult>) {
    if let Err(err) = fut.await {
        log::warn!("query handler failed: {err}");
    }
}

fn default_filter<T, E>() -> FilterFn<T, E> {
    Arc::new(|_current, _next, _metadata| true)
}

fn default_keep_cache_on_error<E>() -> KeepCacheOnErrorFn<E> {
    Arc::new(|_err| false)
}

fn default_extract_ttl<T>() -> ExtractTtlFn<T> {
    Arc::new(|_data| None)
}

/// Default TTL applied when neither `extractTTLFn` nor a per-call override
/// supplies one.
pub const DEFAULT_TTL_DURATION: Duration = Duration::from_secs(300);

/// Builder for a [`Query`] controller's configuration.
pub struct QueryConfig<K, T, E, B>
where
    B: CacheBackend,
{
    query_fn: QueryFn<K, T, E>,
    store: Arc<CacheManager<B, T, E>>,
    provider: Arc<Provider<T, E>>,
    retry_policy: Arc<dyn RetryPolicy<E>>,
    retry_handle_fn: Option<RetryHandleFn<E>>,
    keep_cache_on_error_fn: KeepCacheOnErrorFn<E>,
    extract_ttl_fn: ExtractTtlFn<T>,
    fresh: Duration,
    ttl: Duration,
    placeholder: Option<T>,
    filter_fn: FilterFn<T, E>,
    state_fn: Option<StateFn<T, E>>,
    data_fn: Option<DataFn<T>>,
    error_fn: Option<ErrorFn<E>>,
    key_hasher: Arc<dyn KeyHasher<K>>,
}

impl<K, T, E, B> QueryConfig<K, T, E, B>
where
    K: KeyTuple + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    B: CacheBackend,
{
    pub fn new(query_fn: QueryFn<K, T, E>, store: Arc<CacheManager<B, T, E>>) -> Self {
        QueryConfig {
            query_fn,
            provider: store.provider().clone(),
            store,
            retry_policy: Arc::new(NoRetryPolicy),
            retry_handle_fn: None,
            keep_cache_on_error_fn: default_keep_cache_on_error(),
            extract_ttl_fn: default_extract_ttl(),
            fresh: Duration::ZERO,
            ttl: DEFAULT_TTL_DURATION,
            placeholder: None,
            filter_fn: default_filter(),
            state_fn: None,
            data_fn: None,
            error_fn: None,
            key_hasher: Arc::new(crate::key::DefaultKeyHasher),
        }
    }

    pub fn with_provider(mut self, provider: Arc<Provider<T, E>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy<E>>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_retry_handle_fn(mut self, f: RetryHandleFn<E>) -> Self {
        self.retry_handle_fn = Some(f);
        self
    }

    pub fn with_keep_cache_on_error_fn(mut self, f: KeepCacheOnErrorFn<E>) -> Self {
        self.keep_cache_on_error_fn = f;
        self
    }

    pub fn with_extract_ttl_fn(mut self, f: ExtractTtlFn<T>) -> Self {
        self.extract_ttl_fn = f;
        self
    }

    pub fn with_fresh(mut self, fresh: Duration) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_placeholder(mut self, placeholder: T) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn with_filter_fn(mut self, f: FilterFn<T, E>) -> Self {
        self.filter_fn = f;
        self
    }

    pub fn with_state_fn(mut self, f: StateFn<T, E>) -> Self {
        self.state_fn = Some(f);
        self
    }

    pub fn with_data_fn(mut self, f: DataFn<T>) -> Self {
        self.data_fn = Some(f);
        self
    }

    pub fn with_error_fn(mut self, f: ErrorFn<E>) -> Self {
        self.error_fn = Some(f);
        self
    }

    pub fn with_key_hash_fn(mut self, hasher: Arc<dyn KeyHasher<K>>) -> Self {
        self.key_hasher = hasher;
        self
    }
}

struct MutableSlots<K, T, E> {
    query_fn: QueryFn<K, T, E>,
    retry_policy: Arc<dyn RetryPolicy<E>>,
    retry_handle_fn: Option<RetryHandleFn<E>>,
    keep_cache_on_error_fn: KeepCacheOnErrorFn<E>,
    extract_ttl_fn: ExtractTtlFn<T>,
    filter_fn: FilterFn<T, E>,
    state_fn: Option<StateFn<T, E>>,
    data_fn: Option<DataFn<T>>,
    error_fn: Option<ErrorFn<E>>,
    fresh: Duration,
    ttl: Duration,
    placeholder: Option<T>,
}

/// Which reset path to take: silent context reset, or a reset that also
/// dispatches through the handler triple (see §4.5 `reset`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetTarget {
    Context,
    Handler,
}

/// The outcome of one `execute` call: the state to show immediately, plus
/// an optional handle to the background fetch's eventual outcome.
pub struct QueryExecutionResult<T, E> {
    pub state: QueryState<T, E>,
    next: Option<Arc<ObservablePromise<QueryState<T, E>>>>,
}

impl<T: Clone, E: Clone> QueryExecutionResult<T, E> {
    /// Await the background fetch this execution launched, if any.
    /// Idempotent: repeated calls return the same settled value.
    pub async fn next(&self) -> Option<QueryState<T, E>> {
        match &self.next {
            Some(promise) => Some(promise.join().await),
            None => None,
        }
    }
}

struct QueryCoreInner<K, T, E, B>
where
    K: KeyTuple + Clone + Eq + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    B: CacheBackend + 'static,
{
    store: Arc<CacheManager<B, T, E>>,
    provider: Arc<Provider<T, E>>,
    key_hasher: Arc<dyn KeyHasher<K>>,
    slots: tokio::sync::RwLock<MutableSlots<K, T, E>>,
    state: Mutex<QueryState<T, E>>,
    current_key: Mutex<Option<K>>,
    subscriber: SubscriberHandle<T, E>,
    stats: ControllerStats,
    closed: AtomicBool,
}

impl<K, T, E, B> QueryCoreInner<K, T, E, B>
where
    K: KeyTuple + Clone + Eq + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    B: CacheBackend + 'static,
{
    fn topic(&self, key: &K) -> String {
        // The configured hasher is consulted through `KeyHasher::hash`; the
        // crate-wide default just delegates to `hash_key`.
        self.key_hasher.hash(key)
    }

    async fn ensure_subscribed(self: &Arc<Self>, key: &K) {
        let needs_resubscribe = {
            let current = self.current_key.lock().expect("state mutex poisoned");
            current.as_ref() != Some(key)
        };
        if needs_resubscribe {
            *self.current_key.lock().expect("state mutex poisoned") = Some(key.clone());
            self.subscriber.use_topic(Some(&self.topic(key)));
        }
    }

    /// Apply a self-originated transition: filter, record stats, write
    /// state, dispatch handlers, and fan out to sibling subscribers.
    async fn emit(self: &Arc<Self>, next: QueryState<T, E>, metadata: StateMetadata) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let admitted = self.accept_and_dispatch(next.clone(), metadata.clone()).await;
        if admitted {
            self.subscriber
                .publish(ProviderEvent::Transition {
                    state: next,
                    metadata: metadata.rewritten_for_fanout(),
                })
                .await;
        }
    }

    /// Filter + state write + handler dispatch, shared by self-originated
    /// and provider-originated transitions. Returns whether it was admitted.
    async fn accept_and_dispatch(self: &Arc<Self>, next: QueryState<T, E>, metadata: StateMetadata) -> bool {
        let current = self.state.lock().expect("state mutex poisoned").clone();
        let filter_fn = { self.slots.read().await.filter_fn.clone() };
        if !filter_fn(&current, &next, &metadata) {
            self.stats.record_event_filtered();
            return false;
        }
        self.stats.record_event_processed();
        *self.state.lock().expect("state mutex poisoned") = next.clone();
        self.dispatch_handlers(next, metadata).await;
        true
    }

    async fn dispatch_handlers(self: &Arc<Self>, state: QueryState<T, E>, metadata: StateMetadata) {
        let (state_fn, data_fn, error_fn) = {
            let slots = self.slots.read().await;
            (slots.state_fn.clone(), slots.data_fn.clone(), slots.error_fn.clone())
        };

        if let Some(f) = state_fn {
            self.stats.record_handler_execution();
            isolate_handler_error(f(state.clone(), metadata.clone())).await;
        }
        if let Some(data) = state.data() {
            if let Some(f) = data_fn {
                self.stats.record_handler_execution();
                isolate_handler_error(f(data.clone(), metadata.clone())).await;
            }
        }
        if let Some(error) = state.error() {
            if let Some(f) = error_fn {
                self.stats.record_handler_execution();
                isolate_handler_error(f(error.clone(), metadata.clone())).await;
            }
        }
    }

    /// Listener callback installed on the provider; reacts to sibling
    /// transitions and cache invalidations.
    async fn on_provider_event(self: &Arc<Self>, event: ProviderEvent<T, E>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match event {
            ProviderEvent::Transition { state, metadata } => {
                // Already origin: Provider; dispatch locally without
                // re-publishing (the source controller already fanned out).
                self.accept_and_dispatch(state, metadata).await;
            }
            ProviderEvent::Invalidation => {
                let is_error = matches!(
                    *self.state.lock().expect("state mutex poisoned"),
                    QueryState::Error { .. }
                );
                if is_error {
                    return;
                }
                let key = self.current_key.lock().expect("state mutex poisoned").clone();
                if let Some(key) = key {
                    let topic = self.topic(&key);
                    let promise = self.launch_fetch(key, topic, Source::BackgroundQuery).await;
                    let self_clone = self.clone();
                    tokio::spawn(async move {
                        let settled = promise.join().await;
                        self_clone.accept_after_background(settled).await;
                    });
                }
            }
        }
    }

    /// After a background fetch settles, the emitting happened once inside
    /// `spawn_fetch` (for every subscriber via fan-out); nothing further to
    /// do here besides letting the join complete. Kept as a named hook for
    /// symmetry with `QueryExecutionResult::next`.
    async fn accept_after_background(self: &Arc<Self>, _settled: QueryState<T, E>) {}

    /// Join an in-flight fetch for `topic`, or launch a new one.
    async fn launch_fetch(
        self: &Arc<Self>,
        key: K,
        topic: String,
        source: Source,
    ) -> Arc<ObservablePromise<QueryState<T, E>>> {
        let shared: Arc<SharedTopicState<T, E>> = self
            .provider
            .state(&topic)
            .expect("topic must have shared state while subscribed");

        let mut guard = shared.in_flight.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !existing.is_settled() {
                return existing.clone();
            }
        }
        let promise = ObservablePromise::new();
        *guard = Some(promise.clone());
        drop(guard);

        self.spawn_fetch(key, topic, source, shared, promise.clone());
        promise
    }

    fn spawn_fetch(
        self: &Arc<Self>,
        key: K,
        topic: String,
        source: Source,
        shared: Arc<SharedTopicState<T, E>>,
        promise: Arc<ObservablePromise<QueryState<T, E>>>,
    ) {
        let core = self.clone();
        tokio::spawn(async move {
            let (query_fn, retry_policy, retry_handle_fn, keep_cache_on_error_fn, extract_ttl_fn, ttl) = {
                let slots = core.slots.read().await;
                (
                    slots.query_fn.clone(),
                    slots.retry_policy.clone(),
                    slots.retry_handle_fn.clone(),
                    slots.keep_cache_on_error_fn.clone(),
                    slots.extract_ttl_fn.clone(),
                    slots.ttl,
                )
            };

            let abort = AbortSignal::new();
            let op_key = key.clone();
            let op_abort = abort.clone();
            let op_query_fn = query_fn.clone();
            let result = exec_async_operation(
                move || {
                    let query_fn = op_query_fn.clone();
                    let key = op_key.clone();
                    let abort = op_abort.clone();
                    async move { query_fn(key, abort).await }
                },
                retry_policy.as_ref(),
                retry_handle_fn.as_ref().map(|f| {
                    let f = f.clone();
                    move |attempt: u32, err: &E| f(attempt, err)
                }),
            )
            .await;

            let (final_state, status) = match result {
                Ok(data) => {
                    let effective_ttl = extract_ttl_fn(&data).unwrap_or(ttl);
                    // `set_silent`, not `set`: the `emit` below already fans
                    // this transition out to every other subscriber, so a
                    // publishing write here would double-dispatch them.
                    core.store
                        .set_silent(&key, data.clone(), Some(effective_ttl))
                        .await;
                    (QueryState::Success { data }, PromiseStatus::Fulfilled)
                }
                Err(err) => {
                    if !keep_cache_on_error_fn(&err) {
                        core.store.delete(&key).await;
                        core.stats.record_cache_delete_on_error();
                    }
                    (QueryState::Error { error: err }, PromiseStatus::Rejected)
                }
            };

            let metadata = StateMetadata::new(Origin::SelfOrigin, source, None);
            core.emit(final_state.clone(), metadata).await;

            let mut guard = shared.in_flight.lock().await;
            if let Some(current) = guard.as_ref() {
                if Arc::ptr_eq(current, &promise) {
                    *guard = None;
                }
            }
            drop(guard);

            promise.settle(status, final_state);
        });
    }

    async fn run_no_cache(self: &Arc<Self>, key: K, topic: String, source: Source) -> QueryExecutionResult<T, E> {
        let metadata = StateMetadata::new(Origin::SelfOrigin, source, Some(CacheDirective::NoCache));
        let loading = self.state.lock().expect("state mutex poisoned").into_loading();
        self.emit(loading, metadata).await;

        let promise = self.launch_fetch(key, topic, source).await;
        promise.join().await;
        QueryExecutionResult {
            state: self.state.lock().expect("state mutex poisoned").clone(),
            next: None,
        }
    }

    async fn run_fresh(self: &Arc<Self>, key: K, topic: String) -> QueryExecutionResult<T, E> {
        let fresh_window = { self.slots.read().await.fresh };
        if let Some(entry) = self.store.get_entry(&key).await {
            if entry.is_fresh(fresh_window) {
                self.stats.record_cache_hit();
                let metadata =
                    StateMetadata::new(Origin::SelfOrigin, Source::Cache, Some(CacheDirective::Fresh));
                self.emit(QueryState::Success { data: entry.data }, metadata).await;
                return QueryExecutionResult {
                    state: self.state.lock().expect("state mutex poisoned").clone(),
                    next: None,
                };
            }
        }
        self.stats.record_cache_miss();
        self.run_no_cache(key, topic, Source::Query).await
    }

    async fn run_stale(self: &Arc<Self>, key: K, topic: String) -> QueryExecutionResult<T, E> {
        let fresh_window = { self.slots.read().await.fresh };
        if let Some(entry) = self.store.get_entry(&key).await {
            if entry.is_fresh(fresh_window) {
                self.stats.record_cache_hit();
                let metadata =
                    StateMetadata::new(Origin::SelfOrigin, Source::Cache, Some(CacheDirective::Stale));
                self.emit(QueryState::Success { data: entry.data }, metadata).await;
                return QueryExecutionResult {
                    state: self.state.lock().expect("state mutex poisoned").clone(),
                    next: None,
                };
            }

            let metadata =
                StateMetadata::new(Origin::SelfOrigin, Source::Cache, Some(CacheDirective::Stale));
            self.emit(QueryState::Stale { data: entry.data }, metadata).await;

            let promise = self.launch_fetch(key, topic, Source::BackgroundQuery).await;
            return QueryExecutionResult {
                state: self.state.lock().expect("state mutex poisoned").clone(),
                next: Some(promise),
            };
        }
        self.stats.record_cache_miss();
        self.run_no_cache(key, topic, Source::Query).await
    }
}

/// User-facing read controller: binds a context (query function, cache,
/// provider, options) to the QueryCore loop.
pub struct Query<K, T, E, B>(Arc<QueryCoreInner<K, T, E, B>>)
where
    K: KeyTuple + Clone + Eq + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    B: CacheBackend + 'static;

impl<K, T, E, B> Clone for Query<K, T, E, B>
where
    K: KeyTuple + Clone + Eq + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    B: CacheBackend + 'static,
{
    fn clone(&self) -> Self {
        Query(self.0.clone())
    }
}

impl<K, T, E, B> Query<K, T, E, B>
where
    K: KeyTuple + Clone + Eq + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    B: CacheBackend + 'static,
{
    pub fn create(config: QueryConfig<K, T, E, B>) -> Self {
        let provider = config.provider.clone();
        let store = config.store.clone();
        let key_hasher = config.key_hasher.clone();
        let placeholder = config.placeholder.clone();
        let slots = MutableSlots {
            query_fn: config.query_fn,
            retry_policy: config.retry_policy,
            retry_handle_fn: config.retry_handle_fn,
            keep_cache_on_error_fn: config.keep_cache_on_error_fn,
            extract_ttl_fn: config.extract_ttl_fn,
            filter_fn: config.filter_fn,
            state_fn: config.state_fn,
            data_fn: config.data_fn,
            error_fn: config.error_fn,
            fresh: config.fresh,
            ttl: config.ttl,
            placeholder: config.placeholder,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<QueryCoreInner<K, T, E, B>>| {
            let weak_for_listener = weak.clone();
            let listener: Listener<T, E> = Arc::new(move |event| {
                let weak = weak_for_listener.clone();
                Box::pin(async move {
                    if let Some(core) = weak.upgrade() {
                        core.on_provider_event(event).await;
                    }
                })
            });
            QueryCoreInner {
                store,
                subscriber: SubscriberHandle::new(provider.clone(), listener),
                provider,
                key_hasher,
                slots: tokio::sync::RwLock::new(slots),
                state: Mutex::new(QueryState::Idle { data: placeholder }),
                current_key: Mutex::new(None),
                stats: ControllerStats::new(),
                closed: AtomicBool::new(false),
            }
        });

        Query(inner)
    }

    pub fn state(&self) -> QueryState<T, E> {
        self.0.state.lock().expect("state mutex poisoned").clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.0.stats.snapshot()
    }

    /// Run the cache-directive state machine for `key` (default directive:
    /// `Stale`).
    pub async fn execute(&self, key: K, directive: Option<CacheDirective>) -> QueryExecutionResult<T, E> {
        if self.0.closed.load(Ordering::Acquire) {
            return QueryExecutionResult {
                state: self.state(),
                next: None,
            };
        }
        self.0.ensure_subscribed(&key).await;
        let topic = self.0.topic(&key);
        let effective_directive = directive.unwrap_or(CacheDirective::Stale);
        self.0.stats.set_last_cache_directive(effective_directive);
        match effective_directive {
            CacheDirective::NoCache => self.0.run_no_cache(key, topic, Source::Query).await,
            CacheDirective::Fresh => self.0.run_fresh(key, topic).await,
            CacheDirective::Stale => self.0.run_stale(key, topic).await,
        }
    }

    /// Change the subscribed key: unsubscribe the old topic, subscribe the
    /// new one, then behave as `reset(target)`.
    pub async fn use_key(&self, key: K, target: ResetTarget) {
        *self.0.current_key.lock().expect("state mutex poisoned") = Some(key.clone());
        self.0.subscriber.use_topic(Some(&self.0.topic(&key)));
        self.reset(target).await;
    }

    /// Reset to `Idle{placeholder}`. `Context` does so silently; `Handler`
    /// also dispatches through the handler triple.
    pub async fn reset(&self, target: ResetTarget) {
        let placeholder = { self.0.slots.read().await.placeholder.clone() };
        let next = QueryState::Idle { data: placeholder };
        match target {
            ResetTarget::Context => {
                *self.0.state.lock().expect("state mutex poisoned") = next;
            }
            ResetTarget::Handler => {
                let metadata = StateMetadata::new(Origin::SelfOrigin, Source::Initialization, None);
                *self.0.state.lock().expect("state mutex poisoned") = next.clone();
                self.0.dispatch_handlers(next, metadata).await;
            }
        }
    }

    /// Unsubscribe from the provider and stop emitting further state.
    pub fn dispose(&self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.subscriber.unsubscribe();
    }

    /// Swap the query function used by future fetch launches. An in-flight
    /// retry loop keeps the function it started with.
    pub async fn set_query_fn(&self, query_fn: QueryFn<K, T, E>) {
        self.0.slots.write().await.query_fn = query_fn;
    }

    pub async fn set_filter_fn(&self, filter_fn: FilterFn<T, E>) {
        self.0.slots.write().await.filter_fn = filter_fn;
    }
}

/// Compute the provider topic for a key tuple using the default hasher,
/// matching `CacheManager`'s own key handling.
pub fn default_topic_for<K: KeyTuple>(key: &K) -> String {
    topic_for(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::backoff::BackoffTimer;
    use crate::retry::BasicRetryPolicy;
    use std::sync::atomic::AtomicU32;

    fn key(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn store() -> Arc<CacheManager<InMemoryBackend, String, String>> {
        Arc::new(CacheManager::new(InMemoryBackend::new(), Arc::new(Provider::new())))
    }

    fn ok_fn(value: &'static str) -> QueryFn<Vec<String>, String, String> {
        Arc::new(move |_key, _abort| Box::pin(async move { Ok(value.to_string()) }))
    }

    fn failing_fn() -> QueryFn<Vec<String>, String, String> {
        Arc::new(|_key, _abort| Box::pin(async { Err("boom".to_string()) }))
    }

    #[tokio::test]
    async fn test_successful_fetch_dispatches_data_fn_exactly_once() {
        // Regression test: the post-fetch cache write must not double-
        // deliver the Success transition to the controller that caused it
        // (CacheManager::set_silent vs set).
        let store = store();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        let cfg = QueryConfig::new(ok_fn("v"), store).with_data_fn(Arc::new(move |_data, _meta| {
            let hits = hits_clone.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        let query = Query::create(cfg);

        query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Loading carries no data (nothing to dispatch `data_fn` on); the
        // one Success transition should fire `data_fn` exactly once.
        assert_eq!(query.stats().handler_executions, 1);
    }

    #[tokio::test]
    async fn test_no_cache_fill_then_fail() {
        let store = store();
        let cfg = QueryConfig::new(ok_fn("v"), store.clone());
        let query = Query::create(cfg);

        let result = query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert!(matches!(result.state, QueryState::Success { ref data } if data == "v"));
        assert_eq!(store.get(&key(&["k"])).await, Some("v".to_string()));

        query.set_query_fn(failing_fn()).await;
        let result = query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert!(matches!(result.state, QueryState::Error { ref error } if error == "boom"));
        assert_eq!(store.get(&key(&["k"])).await, None);
        assert_eq!(query.stats().cache_delete_on_error, 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_loading() {
        let store = store();
        store.set(&key(&["k"]), "v".to_string(), Some(Duration::from_secs(30))).await;

        let cfg = QueryConfig::new(failing_fn(), store).with_fresh(Duration::from_secs(60));
        let query = Query::create(cfg);

        let result = query.execute(key(&["k"]), Some(CacheDirective::Fresh)).await;
        assert!(matches!(result.state, QueryState::Success { ref data } if data == "v"));
        assert_eq!(query.stats().cache_hit, 1);
    }

    #[tokio::test]
    async fn test_stale_hit_launches_background_refresh() {
        let store = store();
        store.set(&key(&["k"]), "old".to_string(), Some(Duration::from_millis(200))).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let cfg = QueryConfig::new(ok_fn("new"), store).with_fresh(Duration::from_millis(50));
        let query = Query::create(cfg);

        let result = query.execute(key(&["k"]), Some(CacheDirective::Stale)).await;
        assert!(matches!(result.state, QueryState::Stale { ref data } if data == "old"));

        let settled = result.next().await.expect("background fetch expected");
        assert!(matches!(settled, QueryState::Success { ref data } if data == "new"));
        assert_eq!(query.state(), QueryState::Success { data: "new".to_string() });
    }

    #[tokio::test]
    async fn test_single_flight_across_controllers() {
        let store = store();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let query_fn: QueryFn<Vec<String>, String, String> = Arc::new(move |_key, _abort| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok("v".to_string())
            })
        });

        let provider = Arc::new(Provider::new());
        let cfg_a = QueryConfig::new(query_fn.clone(), store.clone()).with_provider(provider.clone());
        let cfg_b = QueryConfig::new(query_fn, store).with_provider(provider);
        let a = Query::create(cfg_a);
        let b = Query::create(cfg_b);

        let (result_a, result_b) = tokio::join!(
            a.execute(key(&["k"]), Some(CacheDirective::NoCache)),
            b.execute(key(&["k"]), Some(CacheDirective::NoCache)),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result_a.state, QueryState::Success { ref data } if data == "v"));
        assert!(matches!(result_b.state, QueryState::Success { ref data } if data == "v"));
    }

    #[tokio::test]
    async fn test_filter_fn_suppresses_transition() {
        let store = store();
        let cfg = QueryConfig::new(ok_fn("v"), store)
            .with_filter_fn(Arc::new(|_current, next, _metadata| !next.is_loading()));
        let query = Query::create(cfg);

        let before = query.stats();
        query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        let after = query.stats();

        assert!(after.events_filtered > before.events_filtered);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = store();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let query_fn: QueryFn<Vec<String>, String, String> = Arc::new(move |_key, _abort| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok("v".to_string())
                }
            })
        });

        let cfg = QueryConfig::new(query_fn, store)
            .with_retry_policy(Arc::new(BasicRetryPolicy::new(3, BackoffTimer::Fixed(Duration::from_millis(1)))));
        let query = Query::create(cfg);

        let result = query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert!(matches!(result.state, QueryState::Success { ref data } if data == "v"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_prefix_invalidation_triggers_background_revalidation() {
        let store = store();
        store.set(&key(&["a", "u", "1"]), "old".to_string(), None).await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let query_fn: QueryFn<Vec<String>, String, String> = Arc::new(move |_key, _abort| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_string())
            })
        });

        let cfg = QueryConfig::new(query_fn, store.clone());
        let query = Query::create(cfg);
        query.execute(key(&["a", "u", "1"]), Some(CacheDirective::Fresh)).await;

        store.invalidate(&key(&["a", "u"])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_stats_record_last_cache_directive() {
        let store = store();
        let cfg = QueryConfig::new(ok_fn("v"), store);
        let query = Query::create(cfg);

        query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert_eq!(query.stats().last_cache_directive, Some(CacheDirective::NoCache));

        query.execute(key(&["k"]), Some(CacheDirective::Fresh)).await;
        assert_eq!(query.stats().last_cache_directive, Some(CacheDirective::Fresh));
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let store = store();
        let cfg = QueryConfig::new(ok_fn("v"), store).with_placeholder("placeholder".to_string());
        let query = Query::create(cfg);

        query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert!(matches!(query.state(), QueryState::Success { .. }));

        query.reset(ResetTarget::Context).await;
        assert!(matches!(query.state(), QueryState::Idle { data: Some(ref d) } if d == "placeholder"));
    }

    #[tokio::test]
    async fn test_dispose_stops_emission() {
        let store = store();
        let cfg = QueryConfig::new(ok_fn("v"), store);
        let query = Query::create(cfg);
        query.dispose();

        let result = query.execute(key(&["k"]), Some(CacheDirective::NoCache)).await;
        assert!(matches!(result.state, QueryState::Idle { .. }));
    }
}
