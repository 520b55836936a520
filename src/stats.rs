//! Per-controller observability counters.

use crate::state::CacheDirective;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A read-only snapshot of a controller's monotonic counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub cache_delete_on_error: u64,
    pub events_filtered: u64,
    pub events_processed: u64,
    pub handler_executions: u64,
    pub last_cache_directive: Option<CacheDirective>,
}

/// Monotonically increasing counters for one controller, reset only when the
/// controller is disposed and a new one is built in its place.
///
/// All counters use `Relaxed` atomics: they are monitoring data, not
/// synchronization points, matching the ordering discipline the rest of the
/// crate applies to purely observational fields.
#[derive(Default)]
pub struct ControllerStats {
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    cache_delete_on_error: AtomicU64,
    events_filtered: AtomicU64,
    events_processed: AtomicU64,
    handler_executions: AtomicU64,
    last_cache_directive: Mutex<Option<CacheDirective>>,
}

impl ControllerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_delete_on_error(&self) {
        self.cache_delete_on_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a candidate transition was suppressed by `filterFn`.
    ///
    /// Every filtered transition is also counted in `events_processed` (see
    /// `record_event_processed`): `events_processed` is the total number of
    /// candidate transitions considered, whether dispatched or filtered.
    pub fn record_event_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a candidate transition was admitted and dispatched to
    /// handlers.
    pub fn record_event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_execution(&self) {
        self.handler_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_cache_directive(&self, directive: CacheDirective) {
        *self.last_cache_directive.lock().expect("stats mutex poisoned") = Some(directive);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hit: self.cache_hit.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
            cache_delete_on_error: self.cache_delete_on_error.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            handler_executions: self.handler_executions.load(Ordering::Relaxed),
            last_cache_directive: *self.last_cache_directive.lock().expect("stats mutex poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_at_zero() {
        let stats = ControllerStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.cache_hit, 0);
        assert_eq!(snap.events_processed, 0);
        assert_eq!(snap.last_cache_directive, None);
    }

    #[test]
    fn test_stats_increment() {
        let stats = ControllerStats::new();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_event_filtered();
        stats.set_last_cache_directive(CacheDirective::Stale);

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hit, 2);
        assert_eq!(snap.events_filtered, 1);
        assert_eq!(snap.last_cache_directive, Some(CacheDirective::Stale));
    }

    #[test]
    fn test_events_processed_equals_filtered_plus_dispatched() {
        let stats = ControllerStats::new();
        stats.record_event_filtered(); // filtered: +1 filtered, +1 processed
        stats.record_event_processed(); // dispatched: +1 processed
        stats.record_event_filtered(); // filtered: +1 filtered, +1 processed
        stats.record_event_processed(); // dispatched: +1 processed
        stats.record_event_processed(); // dispatched: +1 processed

        let snap = stats.snapshot();
        // property 8: events_processed equals the total number of
        // transitions dispatched to handlers plus filtered events.
        assert_eq!(snap.events_filtered, 2);
        assert_eq!(snap.events_processed, 5);
    }
}
