//! Retry policies and the generic retrying-operation driver.

use crate::backoff::BackoffTimer;
use std::future::Future;
use std::time::Duration;

/// Outcome fed back to a [`RetryPolicy`] after each attempt, for hit-rate
/// feedback (e.g. circuit-breaker-style policies, not implemented here but
/// supported by the trait shape).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Fail,
}

/// Decides whether/when to retry a failed attempt.
///
/// `attempt` is 1-based: it names the retry about to be made (the first
/// retry after the initial call is `attempt == 1`). `delay` returning `None`
/// means "give up" (propagate the error).
pub trait RetryPolicy<E>: Send + Sync {
    /// Whether retry number `attempt` should be made at all.
    fn should_retry(&self, attempt: u32, err: &E) -> bool;

    /// The delay to wait before retrying; `None` gives up immediately.
    fn delay(&self, attempt: u32, err: &E) -> Option<Duration>;

    /// Feedback hook invoked after every attempt settles.
    fn notify(&self, _outcome: AttemptOutcome) {}
}

/// Retries up to `limit` times (0 = no retries) using a [`BackoffTimer`] for
/// delay computation.
pub struct BasicRetryPolicy {
    pub limit: u32,
    pub timer: BackoffTimer,
}

impl BasicRetryPolicy {
    pub fn new(limit: u32, timer: BackoffTimer) -> Self {
        BasicRetryPolicy { limit, timer }
    }
}

impl<E> RetryPolicy<E> for BasicRetryPolicy {
    fn should_retry(&self, attempt: u32, _err: &E) -> bool {
        attempt <= self.limit
    }

    fn delay(&self, attempt: u32, err: &E) -> Option<Duration> {
        if !self.should_retry(attempt, err) {
            return None;
        }
        // BackoffTimer::delay takes a 0-based exponent; `attempt` here is
        // the 1-based retry number, so the first retry uses exponent 0.
        Some(self.timer.delay(attempt - 1))
    }
}

/// A policy that never retries: the first failure is terminal.
#[derive(Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl<E> RetryPolicy<E> for NoRetryPolicy {
    fn should_retry(&self, _attempt: u32, _err: &E) -> bool {
        false
    }

    fn delay(&self, _attempt: u32, _err: &E) -> Option<Duration> {
        None
    }
}

/// Runs `op` to completion, retrying on failure according to `policy`.
///
/// On each failure the attempt counter is incremented, `policy.notify(Fail)`
/// is called, and `policy.delay(attempt, &err)` is consulted: `None` gives
/// up and propagates the error; `Some(d)` waits `d`, invokes `on_retry` (if
/// given; its errors are isolated, logged and ignored), and retries. On
/// success, `policy.notify(Success)` fires and the value is returned.
pub async fn exec_async_operation<T, E, Op, Fut, R>(
    mut op: Op,
    policy: &R,
    mut on_retry: Option<impl FnMut(u32, &E)>,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: RetryPolicy<E> + ?Sized,
{
    let mut retries_done: u32 = 0;
    loop {
        match op().await {
            Ok(value) => {
                policy.notify(AttemptOutcome::Success);
                return Ok(value);
            }
            Err(err) => {
                policy.notify(AttemptOutcome::Fail);
                let next_attempt = retries_done + 1;
                match policy.delay(next_attempt, &err) {
                    None => {
                        debug!(
                            "exec_async_operation giving up after {} attempt(s)",
                            retries_done + 1
                        );
                        return Err(err);
                    }
                    Some(delay) => {
                        retries_done = next_attempt;
                        debug!(
                            "exec_async_operation retrying (attempt {}) after {:?}",
                            retries_done, delay
                        );
                        tokio::time::sleep(delay).await;
                        if let Some(cb) = on_retry.as_mut() {
                            cb(retries_done, &err);
                        }
                    }
                }
            }
        }
    }
}
