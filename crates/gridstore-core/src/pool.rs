//! The client-side write buffer.
//!
//! Every pattern operator that writes (collections, queues, flows,
//! notifications, ...) appends to a `MutationPool` rather than calling the
//! backend directly. This batches unrelated writes under one backend
//! round trip and gives callers a single place to control flush cadence.
//!
//! Pending writes are kept as a flat, ordered list rather than merged by
//! subject: two pattern operators writing to the same subject with
//! different `replace`/`to_delete` settings must each get their own
//! backend call, applied in the order they were enqueued.

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Subject, TimestampSpec};
use crate::monitoring::StoreMetrics;

/// `Size()` above this threshold is a signal to the caller that it should
/// flush mid-operation rather than let the pool grow unbounded (used by
/// collection deletion, which can enqueue one deletion per item).
pub const AUTO_FLUSH_THRESHOLD: usize = 50_000;

/// One pending `MultiSet` call: a subject, the entries to write, whether
/// prior versions of the written attributes should be cleared first, and
/// which attributes to unconditionally clear before writing.
#[derive(Debug, Clone)]
struct PendingWrite {
    subject: Subject,
    entries: Vec<SetEntry>,
    replace: bool,
    to_delete: Vec<Attribute>,
}

/// A buffer of pending subject deletions, attribute deletions, writes and
/// notifications, flushed together in a fixed order.
pub struct MutationPool {
    backend: Arc<dyn Backend>,
    token: AuthToken,
    subject_deletions: Vec<Subject>,
    attribute_deletions: Vec<(Subject, Vec<(Attribute, TimestampSpec)>)>,
    writes: Vec<PendingWrite>,
    notifications: Vec<(Subject, Vec<SetEntry>)>,
    metrics: Option<Arc<StoreMetrics>>,
}

impl std::fmt::Debug for MutationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPool")
            .field("pending_size", &self.size())
            .finish_non_exhaustive()
    }
}

impl MutationPool {
    /// Builds an empty pool writing through `backend` under `token`.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, token: AuthToken) -> Self {
        Self {
            backend,
            token,
            subject_deletions: Vec::new(),
            attribute_deletions: Vec::new(),
            writes: Vec::new(),
            notifications: Vec::new(),
            metrics: None,
        }
    }

    /// Attaches a metrics collector whose `commit_failure` counter is
    /// incremented whenever [`Self::flush`] fails.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The token this pool writes under.
    #[must_use]
    pub fn token(&self) -> &AuthToken {
        &self.token
    }

    /// Enqueues deletion of an entire subject.
    pub fn delete_subject(&mut self, subject: Subject) {
        self.subject_deletions.push(subject);
    }

    /// Enqueues deletion of a batch of entire subjects.
    pub fn delete_subjects(&mut self, subjects: impl IntoIterator<Item = Subject>) {
        self.subject_deletions.extend(subjects);
    }

    /// Enqueues one or more attribute deletions on `subject`.
    pub fn delete_attributes(
        &mut self,
        subject: Subject,
        attributes: Vec<(Attribute, TimestampSpec)>,
    ) {
        self.attribute_deletions.push((subject, attributes));
    }

    /// Enqueues a `MultiSet` call. `to_delete` attributes are cleared
    /// before `entries` is written; when `replace` is `true`, every
    /// attribute named in `entries` has its prior versions cleared too.
    pub fn multi_set(
        &mut self,
        subject: Subject,
        entries: Vec<SetEntry>,
        replace: bool,
        to_delete: Vec<Attribute>,
    ) {
        self.writes.push(PendingWrite {
            subject,
            entries,
            replace,
            to_delete,
        });
    }

    /// Enqueues a single-attribute write with `replace=true` and no
    /// companion deletes — the common case.
    pub fn set(&mut self, subject: Subject, entry: SetEntry) {
        self.multi_set(subject, vec![entry], true, Vec::new());
    }

    /// Enqueues a notification write, flushed after every other pending
    /// mutation so readers never observe a notification for a write that
    /// has not yet landed.
    pub fn notify(&mut self, subject: Subject, entry: SetEntry) {
        self.notifications.push((subject, vec![entry]));
    }

    /// Number of pending delete/set/attribute-delete items. Notifications
    /// are excluded, matching the original's `Size()` semantics.
    #[must_use]
    pub fn size(&self) -> usize {
        self.subject_deletions.len()
            + self
                .attribute_deletions
                .iter()
                .map(|(_, attrs)| attrs.len())
                .sum::<usize>()
            + self.writes.iter().map(|w| w.entries.len()).sum::<usize>()
    }

    /// `true` when [`Self::size`] has crossed [`AUTO_FLUSH_THRESHOLD`];
    /// callers performing a long-running batch (like collection deletion)
    /// should flush and reset when this returns `true`.
    #[must_use]
    pub fn should_auto_flush(&self) -> bool {
        self.size() >= AUTO_FLUSH_THRESHOLD
    }

    /// Flushes everything pending, in order: subject deletions, then
    /// attribute deletions, then writes (in enqueue order), then (if any
    /// of the previous three had content) one backend `Flush`, then
    /// notifications.
    ///
    /// # Errors
    ///
    /// Returns the first backend error encountered; on error the pool
    /// retains whatever had not yet been sent so a caller may retry.
    #[instrument(skip(self))]
    pub async fn flush(&mut self) -> StoreResult<()> {
        let had_content = !self.subject_deletions.is_empty()
            || !self.attribute_deletions.is_empty()
            || !self.writes.is_empty();

        let result = self.flush_inner().await;
        if let Err(err) = &result {
            if let Some(metrics) = &self.metrics {
                metrics.record_commit_failure();
            }
            warn!(error = %err, "mutation pool flush failed");
            return result;
        }

        if had_content {
            self.backend.flush().await?;
        }

        self.flush_notifications().await
    }

    async fn flush_inner(&mut self) -> StoreResult<()> {
        if !self.subject_deletions.is_empty() {
            let subjects = std::mem::take(&mut self.subject_deletions);
            self.backend.delete_subjects(&self.token, &subjects).await?;
        }

        if !self.attribute_deletions.is_empty() {
            let deletions = std::mem::take(&mut self.attribute_deletions);
            for (subject, attrs) in deletions {
                self.backend
                    .delete_attributes(&self.token, &subject, &attrs)
                    .await?;
            }
        }

        if !self.writes.is_empty() {
            let writes = std::mem::take(&mut self.writes);
            for write in writes {
                self.backend
                    .multi_set(
                        &self.token,
                        &write.subject,
                        &write.entries,
                        write.replace,
                        &write.to_delete,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    async fn flush_notifications(&mut self) -> StoreResult<()> {
        if self.notifications.is_empty() {
            return Ok(());
        }
        let notifications = std::mem::take(&mut self.notifications);
        for (subject, entries) in notifications {
            self.backend
                .multi_set(&self.token, &subject, &entries, false, &[])
                .await?;
        }
        Ok(())
    }
}

/// A scoped, flush-on-drop wrapper around [`MutationPool`].
///
/// Because `Drop` cannot run async code, the final flush is spawned onto
/// the runtime the guard was created on. Teardown errors are logged and
/// suppressed rather than propagated, matching teardown semantics
/// elsewhere in the store.
pub struct PoolGuard {
    pool: Option<MutationPool>,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl PoolGuard {
    /// Wraps `pool` for scoped, flush-on-drop use.
    #[must_use]
    pub fn new(pool: MutationPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Borrows the wrapped pool.
    #[allow(clippy::expect_used)] // pool is only cleared by Drop/finish, both of which consume self
    pub fn get_mut(&mut self) -> &mut MutationPool {
        self.pool
            .as_mut()
            .expect("PoolGuard::pool only cleared by Drop/finish, which consume self")
    }

    /// Flushes and consumes the guard without waiting on drop.
    ///
    /// # Errors
    ///
    /// Propagates [`MutationPool::flush`] errors.
    pub async fn finish(mut self) -> StoreResult<()> {
        if let Some(mut pool) = self.pool.take() {
            pool.flush().await?;
        }
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            tokio::spawn(async move {
                if let Err(err) = pool.flush().await {
                    warn!(error = %err, "failed to flush mutation pool on drop");
                }
            });
        }
    }
}
