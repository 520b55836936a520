//! MutationCore: the retrying write pipeline, state machine, and handler
//! dispatch for write operations.

use crate::provider::{ObservablePromise, PromiseStatus};
use crate::query::{AbortSignal, HandlerResult};
use crate::retry::{exec_async_operation, NoRetryPolicy, RetryPolicy};
use crate::stats::{ControllerStats, StatsSnapshot};
use crate::state::{MutationState, Origin, Source, StateMetadata};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub type MutationFn<I, T, E> = Arc<dyn Fn(I, AbortSignal) -> BoxFut<Result<T, E>> + Send + Sync>;
pub type FilterFn<T, E> = Arc<
    dyn Fn(&MutationState<T, E>, &MutationState<T, E>, &StateMetadata) -> bool + Send + Sync,
>;
pub type StateFn<T, E> =
    Arc<dyn Fn(MutationState<T, E>, StateMetadata) -> BoxFut<HandlerResult> + Send + Sync>;
pub type DataFn<T> = Arc<dyn Fn(T, StateMetadata) -> BoxFut<HandlerResult> + Send + Sync>;
pub type ErrorFn<E> = Arc<dyn Fn(E, StateMetadata) -> BoxFut<HandlerResult> + Send + Sync>;
pub type RetryHandleFn<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;

async fn isolate_handler_error(fut: BoxFut<HandlerResult>) {
    if let Err(err) = fut.await {
        log::warn!("mutation handler failed: {err}");
    }
}

fn default_filter<T, E>() -> FilterFn<T, E> {
    Arc::new(|_current, _next, _metadata| true)
}

/// Builder for a [`Mutation`] controller's configuration.
pub struct MutationConfig<I, T, E> {
    mutation_fn: MutationFn<I, T, E>,
    retry_policy: Arc<dyn RetryPolicy<E>>,
    retry_handle_fn: Option<RetryHandleFn<E>>,
    placeholder: Option<T>,
    filter_fn: FilterFn<T, E>,
    state_fn: Option<StateFn<T, E>>,
    data_fn: Option<DataFn<T>>,
    error_fn: Option<ErrorFn<E>>,
}

impl<I, T, E> MutationConfig<I, T, E>
where
    I: Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(mutation_fn: MutationFn<I, T, E>) -> Self {
        MutationConfig {
            mutation_fn,
            retry_policy: Arc::new(NoRetryPolicy),
            retry_handle_fn: None,
            placeholder: None,
            filter_fn: default_filter(),
            state_fn: None,
            data_fn: None,
            error_fn: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy<E>>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_retry_handle_fn(mut self, f: RetryHandleFn<E>) -> Self {
        self.retry_handle_fn = Some(f);
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
}

struct MutableSlots<I, T, E> {
    mutation_fn: MutationFn<I, T, E>,
    retry_policy: Arc<dyn RetryPolicy<E>>,
    retry_handle_fn: Option<RetryHandleFn<E>>,
    filter_fn: FilterFn<T, E>,
    state_fn: Option<StateFn<T, E>>,
    data_fn: Option<DataFn<T>>,
    error_fn: Option<ErrorFn<E>>,
    placeholder: Option<T>,
}

/// A handle on one `execute_async` call: the `Loading` state emitted
/// immediately, plus a promise for the eventual terminal state.
pub struct MutationExecutionResult<T, E> {
    pub state: MutationState<T, E>,
    settled: Arc<ObservablePromise<MutationState<T, E>>>,
}

impl<T: Clone, E: Clone> MutationExecutionResult<T, E> {
    pub async fn result(&self) -> MutationState<T, E> {
        self.settled.join().await
    }
}

struct MutationCoreInner<I, T, E>
where
    I: Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    slots: tokio::sync::RwLock<MutableSlots<I, T, E>>,
    state: Mutex<MutationState<T, E>>,
    stats: ControllerStats,
    closed: AtomicBool,
}

impl<I, T, E> MutationCoreInner<I, T, E>
where
    I: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn emit(self: &Arc<Self>, next: MutationState<T, E>, metadata: StateMetadata) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let current = self.state.lock().expect("state mutex poisoned").clone();
        let filter_fn = { self.slots.read().await.filter_fn.clone() };
        if !filter_fn(&current, &next, &metadata) {
            self.stats.record_event_filtered();
            return;
        }
        self.stats.record_event_processed();
        *self.state.lock().expect("state mutex poisoned") = next.clone();
        self.dispatch_handlers(next, metadata).await;
    }

    async fn dispatch_handlers(self: &Arc<Self>, state: MutationState<T, E>, metadata: StateMetadata) {
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

    fn spawn_run(
        self: &Arc<Self>,
        input: I,
        promise: Arc<ObservablePromise<MutationState<T, E>>>,
    ) {
        let core = self.clone();
        tokio::spawn(async move {
            let (mutation_fn, retry_policy, retry_handle_fn) = {
                let slots = core.slots.read().await;
                (
                    slots.mutation_fn.clone(),
                    slots.retry_policy.clone(),
                    slots.retry_handle_fn.clone(),
                )
            };

            let abort = AbortSignal::new();
            let op_input = input;
            let op_abort = abort.clone();
            let op_mutation_fn = mutation_fn.clone();
            let result = exec_async_operation(
                move || {
                    let mutation_fn = op_mutation_fn.clone();
                    let input = op_input.clone();
                    let abort = op_abort.clone();
                    async move { mutation_fn(input, abort).await }
                },
                retry_policy.as_ref(),
                retry_handle_fn.as_ref().map(|f| {
                    let f = f.clone();
                    move |attempt: u32, err: &E| f(attempt, err)
                }),
            )
            .await;

            let (final_state, status) = match result {
                Ok(data) => (MutationState::Success { data }, PromiseStatus::Fulfilled),
                Err(error) => (MutationState::Error { error }, PromiseStatus::Rejected),
            };

            let metadata = StateMetadata::new(Origin::SelfOrigin, Source::Mutation, None);
            core.emit(final_state.clone(), metadata).await;
            promise.settle(status, final_state);
        });
    }
}

/// User-facing write controller: binds a context (mutation function,
/// retry policy, handlers) to the MutationCore loop.
pub struct Mutation<I, T, E>(Arc<MutationCoreInner<I, T, E>>)
where
    I: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static;

impl<I, T, E> Clone for Mutation<I, T, E>
where
    I: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Mutation(self.0.clone())
    }
}

impl<I, T, E> Mutation<I, T, E>
where
    I: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn create(config: MutationConfig<I, T, E>) -> Self {
        let placeholder = config.placeholder.clone();
        let slots = MutableSlots {
            mutation_fn: config.mutation_fn,
            retry_policy: config.retry_policy,
            retry_handle_fn: config.retry_handle_fn,
            filter_fn: config.filter_fn,
            state_fn: config.state_fn,
            data_fn: config.data_fn,
            error_fn: config.error_fn,
            placeholder: config.placeholder,
        };
        Mutation(Arc::new(MutationCoreInner {
            slots: tokio::sync::RwLock::new(slots),
            state: Mutex::new(MutationState::Idle { data: placeholder }),
            stats: ControllerStats::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn state(&self) -> MutationState<T, E> {
        self.0.state.lock().expect("state mutex poisoned").clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.0.stats.snapshot()
    }

    /// Run the mutation to completion and return its terminal state.
    pub async fn execute(&self, input: I) -> MutationState<T, E> {
        if self.0.closed.load(Ordering::Acquire) {
            return self.state();
        }
        let metadata = StateMetadata::new(Origin::SelfOrigin, Source::Mutation, None);
        self.0.emit(MutationState::Loading, metadata).await;

        let promise = ObservablePromise::new();
        self.0.spawn_run(input, promise.clone());
        promise.join().await
    }

    /// Emit `Loading` and launch the mutation in the background, returning
    /// immediately. Awaiting `result()` on the returned handle yields the
    /// terminal state.
    pub async fn execute_async(&self, input: I) -> MutationExecutionResult<T, E> {
        if self.0.closed.load(Ordering::Acquire) {
            let settled = ObservablePromise::new();
            settled.settle(PromiseStatus::Rejected, self.state());
            return MutationExecutionResult {
                state: self.state(),
                settled,
            };
        }
        let metadata = StateMetadata::new(Origin::SelfOrigin, Source::Mutation, None);
        self.0.emit(MutationState::Loading, metadata).await;

        let promise = ObservablePromise::new();
        self.0.spawn_run(input, promise.clone());
        MutationExecutionResult {
            state: MutationState::Loading,
            settled: promise,
        }
    }

    /// Reset to `Idle{placeholder}`.
    pub async fn reset(&self) {
        let placeholder = { self.0.slots.read().await.placeholder.clone() };
        *self.0.state.lock().expect("state mutex poisoned") = MutationState::Idle { data: placeholder };
    }

    pub fn dispose(&self) {
        self.0.closed.store(true, Ordering::Release);
    }

    /// Swap the mutation function used by future `execute`/`execute_async`
    /// calls. An in-flight retry loop keeps the function it started with.
    pub async fn set_mutation_fn(&self, mutation_fn: MutationFn<I, T, E>) {
        self.0.slots.write().await.mutation_fn = mutation_fn;
    }
}
