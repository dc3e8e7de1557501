//! Process-wide performance counters.
//!
//! The only global state in the crate: a lock-free
//! counters block, initialized lazily on first access and torn down
//! implicitly at process exit. All mutators are atomics; nothing here
//! ever blocks.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub executions_started: AtomicU64,
    pub executions_succeeded: AtomicU64,
    pub executions_failed: AtomicU64,
    pub executions_skipped: AtomicU64,
    pub retries: AtomicU64,
    pub event_watcher_fallbacks: AtomicU64,
    pub reconciles: AtomicU64,
    peak_concurrency: AtomicUsize,
    current_concurrency: AtomicUsize,
}

impl Metrics {
    fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
        let current = self.current_concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_concurrency.fetch_max(current, Ordering::AcqRel);
    }

    pub fn record_stop(&self) {
        self.current_concurrency.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_success(&self) {
        self.executions_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.executions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.executions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.event_watcher_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconcile(&self) {
        self.reconciles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrency.load(Ordering::Acquire)
    }

    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::Acquire)
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Returns the process-wide metrics instance, initializing it on first use.
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
