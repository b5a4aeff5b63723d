//! Production monitoring for the store: structured counters and gauges,
//! collected the same way regardless of which concrete [`crate::backend::Backend`]
//! is configured underneath.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Thread-safe counters and gauges tracked across the store's lifetime.
///
/// Counters use relaxed atomics rather than a `RwLock`-guarded struct: they
/// are incremented from hot paths (every lock retry, every queue claim) and
/// never need a consistent snapshot across fields, only per-field accuracy.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Number of times a `MutationPool::flush` failed to reach the backend.
    commit_failure: AtomicU64,
    /// Number of `SubjectLock` acquisition retries across all callers.
    datastore_retries: AtomicU64,
    /// Number of tasks whose TTL expired before being completed.
    task_ttl_expired_count: AtomicU64,
    /// Number of tasks redelivered after a prior lease expired.
    task_retransmission_count: AtomicU64,
    /// Approximate backend size in bytes, as last reported by the size
    /// monitor loop. Signed so a backend that can only estimate size may
    /// report `-1` to mean "unknown" without a sentinel `Option` dance at
    /// every call site.
    datastore_size: AtomicI64,
}

impl StoreMetrics {
    /// Builds a fresh, zeroed metrics collector.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Increments the commit-failure counter.
    pub fn record_commit_failure(&self) {
        self.commit_failure.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the subject-lock retry counter.
    pub fn record_retry(&self) {
        self.datastore_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the task-TTL-expired counter.
    pub fn record_task_ttl_expired(&self) {
        self.task_ttl_expired_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the task-retransmission counter.
    pub fn record_task_retransmission(&self) {
        self.task_retransmission_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Updates the datastore size gauge.
    pub fn set_datastore_size(&self, bytes: i64) {
        self.datastore_size.store(bytes, Ordering::Relaxed);
        if bytes < 0 {
            warn!("backend reported unknown size");
        }
    }

    /// Current value of the commit-failure counter.
    #[must_use]
    pub fn commit_failure_count(&self) -> u64 {
        self.commit_failure.load(Ordering::Relaxed)
    }

    /// Current value of the retry counter.
    #[must_use]
    pub fn retry_count(&self) -> u64 {
        self.datastore_retries.load(Ordering::Relaxed)
    }

    /// Current value of the task-TTL-expired counter.
    #[must_use]
    pub fn task_ttl_expired_count(&self) -> u64 {
        self.task_ttl_expired_count.load(Ordering::Relaxed)
    }

    /// Current value of the task-retransmission counter.
    #[must_use]
    pub fn task_retransmission_count(&self) -> u64 {
        self.task_retransmission_count.load(Ordering::Relaxed)
    }

    /// Current value of the datastore size gauge.
    #[must_use]
    pub fn datastore_size(&self) -> i64 {
        self.datastore_size.load(Ordering::Relaxed)
    }
}
