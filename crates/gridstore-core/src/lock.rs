//! Advisory subject locks.
//!
//! A lock is nothing more than an expiry timestamp written to a
//! well-known attribute on the locked subject. Acquiring writes
//! `now + lease` if no lock is present or the existing one has expired;
//! everyone else sees a `LockContended` error until the lease passes.
//! There is no central lock manager — any holder of a [`crate::backend::Backend`]
//! can race to acquire, which is why callers should go through
//! [`SubjectLock::retry_wrapper`] rather than a single bare attempt.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::{StoreError, StoreResult};
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec};
use crate::monitoring::StoreMetrics;

/// The attribute an advisory lock's expiry timestamp is stored under.
pub const LOCK_ATTRIBUTE: &str = "aff4:lease";

/// Default lease duration granted by [`SubjectLock::acquire`].
pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

/// A held advisory lock on a single subject.
///
/// Dropping a `SubjectLock` without calling [`Self::release`] leaves the
/// lock in place until its lease naturally expires; release is best-effort
/// and not automatic, because releasing requires an async backend call
/// that `Drop` cannot perform. Use [`LockGuard`] for scoped,
/// release-on-drop semantics.
#[derive(Debug)]
pub struct SubjectLock {
    subject: Subject,
    expiry: Timestamp,
}

impl SubjectLock {
    fn lock_attribute() -> Attribute {
        Attribute::new(LOCK_ATTRIBUTE)
    }

    /// Attempts to acquire a lock on `subject` once, with no retry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockContended`] if an unexpired lock is
    /// already present. Propagates backend errors.
    #[instrument(skip(backend, token))]
    pub async fn acquire(
        backend: &dyn Backend,
        token: &AuthToken,
        subject: &Subject,
        lease: Duration,
    ) -> StoreResult<Self> {
        let attribute = Self::lock_attribute();
        let now = Timestamp::now();
        let existing = backend
            .resolve(token, subject, std::slice::from_ref(&attribute), TimestampSpec::Newest)
            .await?;

        if let Some(cell) = existing.first() {
            if let Some(expiry) = cell.value.as_integer() {
                if expiry > now.0 {
                    return Err(StoreError::LockContended {
                        subject: subject.as_str().to_string(),
                    });
                }
            }
        }

        let lease_micros = i64::try_from(lease.as_micros()).unwrap_or(i64::MAX);
        let expiry = now.plus_micros(lease_micros);
        backend
            .multi_set(
                token,
                subject,
                &[SetEntry {
                    attribute,
                    timestamp: Timestamp::now(),
                    value: crate::model::Value::Integer(expiry.0),
                }],
                true,
                &[],
            )
            .await?;

        debug!(subject = %subject, expiry = expiry.0, "acquired subject lock");
        Ok(Self {
            subject: subject.clone(),
            expiry,
        })
    }

    /// Retries [`Self::acquire`] with a fixed backoff increment until it
    /// succeeds or `max_wait` has elapsed, at which point the last
    /// encountered error is returned. Blocks across retries.
    ///
    /// Every retry increments [`StoreMetrics::record_retry`], mirroring the
    /// original's `datastore_retries` counter.
    ///
    /// # Errors
    ///
    /// Returns the last [`StoreError`] seen once `max_wait` elapses without
    /// a successful acquisition.
    #[instrument(skip(backend, token, metrics))]
    pub async fn retry_wrapper(
        backend: &dyn Backend,
        token: &AuthToken,
        subject: &Subject,
        lease: Duration,
        retry_interval: Duration,
        max_wait: Duration,
    ) -> StoreResult<Self> {
        let metrics: Option<Arc<StoreMetrics>> = None;
        Self::retry_wrapper_with_metrics(backend, token, subject, lease, retry_interval, max_wait, true, metrics).await
    }

    /// As [`Self::retry_wrapper`], additionally recording each retry on
    /// `metrics` when present and accepting a `blocking` flag: when
    /// `false`, the first contention failure is returned immediately
    /// without entering the backoff loop at all, rather than being
    /// retried until `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns the last [`StoreError`] seen: immediately when `blocking`
    /// is `false` and the first attempt fails, or once `max_wait` elapses
    /// without a successful acquisition when `blocking` is `true`.
    pub async fn retry_wrapper_with_metrics(
        backend: &dyn Backend,
        token: &AuthToken,
        subject: &Subject,
        lease: Duration,
        retry_interval: Duration,
        max_wait: Duration,
        blocking: bool,
        metrics: Option<Arc<StoreMetrics>>,
    ) -> StoreResult<Self> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            match Self::acquire(backend, token, subject, lease).await {
                Ok(lock) => return Ok(lock),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if !blocking => return Err(err),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(subject = %subject, "gave up acquiring subject lock");
                        return Err(err);
                    }
                    if let Some(metrics) = &metrics {
                        metrics.record_retry();
                    }
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    /// Extends the lock's expiry by writing a new lease.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn update_lease(
        &mut self,
        backend: &dyn Backend,
        token: &AuthToken,
        lease: Duration,
    ) -> StoreResult<()> {
        let lease_micros = i64::try_from(lease.as_micros()).unwrap_or(i64::MAX);
        let expiry = Timestamp::now().plus_micros(lease_micros);
        backend
            .multi_set(
                token,
                &self.subject,
                &[SetEntry {
                    attribute: Self::lock_attribute(),
                    timestamp: Timestamp::now(),
                    value: crate::model::Value::Integer(expiry.0),
                }],
                true,
                &[],
            )
            .await?;
        self.expiry = expiry;
        Ok(())
    }

    /// Releases the lock by deleting its expiry cell.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn release(self, backend: &dyn Backend, token: &AuthToken) -> StoreResult<()> {
        backend
            .delete_attributes(
                token,
                &self.subject,
                &[(Self::lock_attribute(), TimestampSpec::All)],
            )
            .await
    }

    /// The subject this lock guards.
    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// The lock's current expiry timestamp.
    #[must_use]
    pub fn expiry(&self) -> Timestamp {
        self.expiry
    }
}


/// A scoped, release-on-drop wrapper around [`SubjectLock`].
///
/// The Rust-native replacement for the original's
/// `__enter__`/`__exit__` context manager. Because `Drop` cannot run
/// async code, the release is spawned onto the runtime the guard was
/// created on; teardown errors from that spawned release are logged and
/// otherwise suppressed, matching teardown semantics elsewhere in the
/// store.
#[derive(Debug)]
pub struct LockGuard {
    lock: Option<SubjectLock>,
    backend: Arc<dyn Backend>,
    token: AuthToken,
}

impl LockGuard {
    /// Acquires a lock and wraps it for scoped release.
    ///
    /// # Errors
    ///
    /// Propagates [`SubjectLock::acquire`] errors.
    pub async fn acquire(
        backend: Arc<dyn Backend>,
        token: AuthToken,
        subject: &Subject,
        lease: Duration,
    ) -> StoreResult<Self> {
        let lock = SubjectLock::acquire(backend.as_ref(), &token, subject, lease).await?;
        Ok(Self {
            lock: Some(lock),
            backend,
            token,
        })
    }

    /// The held lock, if not already released.
    #[must_use]
    pub fn lock(&self) -> Option<&SubjectLock> {
        self.lock.as_ref()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let backend = Arc::clone(&self.backend);
            let token = self.token.clone();
            tokio::spawn(async move {
                if let Err(err) = lock.release(backend.as_ref(), &token).await {
                    warn!(error = %err, "failed to release subject lock on drop");
                }
            });
        }
    }
}
