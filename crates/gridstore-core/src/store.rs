//! The top-level store handle.
//!
//! `GridStore` owns the concrete [`Backend`], the shared [`StoreMetrics`]
//! collector, and the background flusher/size-monitor loops; the pattern
//! operator modules stay free functions operating on a `&dyn Backend` plus
//! a borrowed [`MutationPool`] so they never depend on this type. Facade
//! methods here exist purely for convenience: resolve the caller's token,
//! build a short-lived pool, call into the operator, flush.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::backend::memory::MemoryBackend;
use crate::backend::Backend;
use crate::config::{AuthToken, DatastoreImplementation, StoreConfig};
use crate::error::StoreResult;
use crate::model::Subject;
use crate::monitoring::StoreMetrics;
use crate::notify::Notification;
use crate::pool::MutationPool;

/// The store's process-wide handle.
///
/// Constructed once via [`GridStore::init`] and shared as an `Arc`; torn
/// down deterministically via [`GridStore::shutdown`] rather than relying
/// on a destructor to flush pending state.
pub struct GridStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    flusher_stop: Arc<Notify>,
    size_monitor_stop: Arc<Notify>,
    flusher_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    size_monitor_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GridStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridStore").field("config", &self.config).finish_non_exhaustive()
    }
}

impl GridStore {
    /// Builds the configured backend, starts the background flusher and
    /// size-monitor loops, and returns the shared handle.
    #[must_use]
    pub fn init(config: StoreConfig) -> Arc<Self> {
        let backend: Arc<dyn Backend> = match config.datastore_implementation {
            DatastoreImplementation::Memory => Arc::new(MemoryBackend::new()),
        };
        let metrics = StoreMetrics::new();
        let flusher_stop = Arc::new(Notify::new());
        let size_monitor_stop = Arc::new(Notify::new());

        let flusher_handle = tokio::spawn(Self::flusher_loop(
            Arc::clone(&backend),
            Arc::clone(&metrics),
            config.flush_interval,
            Arc::clone(&flusher_stop),
        ));
        let size_monitor_handle = tokio::spawn(Self::size_monitor_loop(
            Arc::clone(&backend),
            Arc::clone(&metrics),
            config.size_monitor_interval,
            Arc::clone(&size_monitor_stop),
        ));

        info!("store initialized");
        Arc::new(Self {
            backend,
            config,
            metrics,
            flusher_stop,
            size_monitor_stop,
            flusher_handle: std::sync::Mutex::new(Some(flusher_handle)),
            size_monitor_handle: std::sync::Mutex::new(Some(size_monitor_handle)),
        })
    }

    async fn flusher_loop(backend: Arc<dyn Backend>, metrics: Arc<StoreMetrics>, interval: Duration, stop: Arc<Notify>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = backend.flush().await {
                        metrics.record_commit_failure();
                        warn!(error = %err, "background flush failed");
                    }
                }
                () = stop.notified() => break,
            }
        }
    }

    async fn size_monitor_loop(backend: Arc<dyn Backend>, metrics: Arc<StoreMetrics>, interval: Duration, stop: Arc<Notify>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match backend.size().await {
                        Ok(size) => metrics.set_datastore_size(size),
                        Err(err) => warn!(error = %err, "size poll failed"),
                    }
                }
                () = stop.notified() => break,
            }
        }
    }

    /// The configured backend, for callers that need direct access beyond
    /// the pattern operators (diagnostics, custom scans).
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The shared metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    /// The resolved configuration this store was initialized with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Builds a fresh [`MutationPool`] writing through this store's
    /// backend, bound to `token` once resolved against [`AuthMode`](crate::config::AuthMode).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::StoreError::Unauthorized`] if `token` is
    /// rejected by the configured auth mode.
    pub fn mutation_pool(&self, token: AuthToken) -> StoreResult<MutationPool> {
        let token = self.config.resolve_token(token)?;
        Ok(MutationPool::new(Arc::clone(&self.backend), token).with_metrics(Arc::clone(&self.metrics)))
    }

    /// Enqueues and immediately flushes `notifications` for `shard`.
    ///
    /// # Errors
    ///
    /// Propagates token resolution and backend errors.
    #[instrument(skip(self, notifications))]
    pub async fn create_notifications(&self, token: AuthToken, shard: &Subject, notifications: &[Notification]) -> StoreResult<()> {
        let mut pool = self.mutation_pool(token)?;
        crate::notify::create_notifications(&mut pool, shard, notifications)?;
        pool.flush().await
    }

    /// Reads notifications pending on `shard` scheduled at or before `end_ts`,
    /// capped at `limit`.
    ///
    /// # Errors
    ///
    /// Propagates token resolution and backend errors.
    pub async fn get_notifications(
        &self,
        token: AuthToken,
        shard: &Subject,
        end_ts: crate::model::Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        let token = self.config.resolve_token(token)?;
        crate::notify::get_notifications(self.backend.as_ref(), &token, shard, end_ts, limit).await
    }

    /// Enqueues and immediately flushes removal of `session_id`'s
    /// notification on `shard`, restricted to `[start, end]`.
    ///
    /// # Errors
    ///
    /// Propagates token resolution and backend errors.
    pub async fn delete_notifications(
        &self,
        token: AuthToken,
        shard: &Subject,
        session_id: &Subject,
        start: crate::model::Timestamp,
        end: crate::model::Timestamp,
    ) -> StoreResult<()> {
        let mut pool = self.mutation_pool(token)?;
        crate::notify::delete_notifications(&mut pool, std::slice::from_ref(shard), std::slice::from_ref(session_id), start, end);
        pool.flush().await
    }

    /// Signals the background loops to stop, joins them, and issues a
    /// final best-effort backend flush. Join/flush failures are logged
    /// and suppressed, matching teardown semantics elsewhere in the store.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.flusher_stop.notify_one();
        self.size_monitor_stop.notify_one();

        if let Some(handle) = self.flusher_handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "flusher loop join failed");
            }
        }
        if let Some(handle) = self.size_monitor_handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "size monitor loop join failed");
            }
        }

        if let Err(err) = self.backend.flush().await {
            warn!(error = %err, "final shutdown flush failed");
        }
        info!("store shut down");
    }
}
