//! Retry backoff delay computation.

use std::time::Duration;

/// Computes the delay before the next retry attempt from the attempt index
/// (0-based: `attempt` is the number of attempts already made).
#[derive(Clone, Copy, Debug)]
pub enum BackoffTimer {
    /// Always wait the same duration.
    Fixed(Duration),
    /// `min(limit, base * (attempt + 1))`.
    Linear { base: Duration, limit: Duration },
    /// `min(limit, base * 2^attempt)`.
    Exponential { base: Duration, limit: Duration },
    /// `min(limit, base * 2^attempt) * U[0, 1)`.
    JitterExponential { base: Duration, limit: Duration },
}

impl BackoffTimer {
    /// Compute the delay for the given (0-based) attempt index.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffTimer::Fixed(d) => d,
            BackoffTimer::Linear { base, limit } => {
                let scaled = base.saturating_mul(attempt.saturating_add(1));
                scaled.min(limit)
            }
            BackoffTimer::Exponential { base, limit } => exponential(base, limit, attempt),
            BackoffTimer::JitterExponential { base, limit } => {
                let capped = exponential(base, limit, attempt);
                capped.mul_f64(rand::random::<f64>())
            }
        }
    }
}

fn exponential(base: Duration, limit: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(limit)
}
