//! Task queues: a subject whose `task:<8-digit-decimal-id>` attributes
//! hold serialized task messages, claimed with a lease expressed purely
//! as a future write timestamp.
//!
//! The lease-by-future-timestamp trick is load-bearing: [`query_and_own`]
//! rewrites a claimed task's cell at `now + lease`, which both records
//! the new lease *and* hides the task from any subsequent query bounded
//! by `[0, now]` — there is no separate lease column to go stale or to
//! forget to check. Any caller reading tasks must bound its resolve by
//! the current time or it will see leased-but-unexpired tasks.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::{StoreError, StoreResult};
use crate::lock::SubjectLock;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::monitoring::StoreMetrics;
use crate::pool::MutationPool;

const TASK_ATTRIBUTE_PREFIX: &str = "task:";

/// A queued task message: scheduling metadata plus an opaque payload the
/// core never interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// The queue (subject) this task is scheduled on.
    pub queue: Subject,
    /// The task's id, encoded as an 8-digit decimal attribute suffix.
    pub id: u32,
    /// Higher priority tasks are returned first by read-only queries.
    pub priority: i64,
    /// Remaining claim attempts before the task is dropped.
    pub task_ttl: u32,
    /// The opaque, caller-serialized task body.
    pub payload: Vec<u8>,
}

impl Task {
    /// The `task_ttl` a freshly scheduled task starts with.
    pub const MAX_TTL: u32 = 5;

    fn attribute(&self) -> Attribute {
        task_attribute(self.id)
    }
}

fn task_attribute(id: u32) -> Attribute {
    Attribute::new(format!("{TASK_ATTRIBUTE_PREFIX}{id:08}"))
}

fn encode_task(task: &Task) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(task).map_err(|err| StoreError::InvalidArgument(format!("encoding task: {err}")))
}

fn decode_task(bytes: &[u8]) -> StoreResult<Task> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::InvalidArgument(format!("decoding task: {err}")))
}

/// Groups `tasks` by queue and enqueues one `MultiSet` per queue, all
/// writing at `timestamp`.
pub fn schedule_tasks(pool: &mut MutationPool, tasks: &[Task], timestamp: Timestamp) -> StoreResult<()> {
    let mut by_queue: HashMap<Subject, Vec<SetEntry>> = HashMap::new();
    for task in tasks {
        let entry = SetEntry {
            attribute: task.attribute(),
            timestamp,
            value: Value::bytes(encode_task(task)?),
        };
        by_queue.entry(task.queue.clone()).or_default().push(entry);
    }
    for (queue, entries) in by_queue {
        pool.multi_set(queue, entries, true, Vec::new());
    }
    Ok(())
}

/// A task returned by [`query_and_own`]: a claimed [`Task`] plus the
/// bookkeeping the original lease protocol attaches on read.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    /// The claimed task, with `task_ttl` already decremented.
    pub task: Task,
    /// The task's pre-claim scheduled timestamp.
    pub eta: Timestamp,
    /// `user@host:pid`-style identity of the claiming leaseholder.
    pub leased_by: String,
}

/// A task returned by a non-leasing read ([`multi_query`], [`query_tasks`]).
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    /// The task as currently stored.
    pub task: Task,
    /// The task's scheduled timestamp.
    pub eta: Timestamp,
}

/// Parameters for [`query_and_own`].
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    /// How long the claim lasts before the task becomes visible again.
    pub lease: Duration,
    /// Stop once this many tasks have been claimed.
    pub limit: usize,
    /// Only tasks scheduled at or before this timestamp are eligible;
    /// `None` means "now".
    pub upper_ts: Option<Timestamp>,
    /// Identity recorded against each claimed task.
    pub leaseholder: String,
    /// Backoff increment for the queue's subject-lock retry.
    pub retry_interval: Duration,
    /// Cumulative wait budget for the queue's subject-lock retry.
    pub max_wait: Duration,
}

/// Claims up to `options.limit` tasks from `queue`, leasing each by
/// rewriting its cell at a future timestamp.
///
/// Returns an empty list (rather than an error) when the queue's subject
/// lock is contended or the backend is transiently unavailable — the
/// caller is expected to retry on its own schedule.
///
/// # Errors
///
/// Propagates any other backend error.
#[instrument(skip(backend, token, metrics))]
pub async fn query_and_own(
    backend: &dyn Backend,
    token: &AuthToken,
    queue: &Subject,
    options: ClaimOptions,
    metrics: Option<&StoreMetrics>,
) -> StoreResult<Vec<LeasedTask>> {
    let lock = match SubjectLock::retry_wrapper(
        backend,
        token,
        queue,
        options.lease,
        options.retry_interval,
        options.max_wait,
    )
    .await
    {
        Ok(lock) => lock,
        Err(StoreError::LockContended { .. }) => return Ok(Vec::new()),
        Err(err @ StoreError::BackendUnavailable(_)) => {
            warn!(queue = %queue, error = %err, "datastore exception claiming queue");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    let claimed = claim_locked(backend, token, queue, &options, metrics).await;

    if let Err(err) = lock.release(backend, token).await {
        warn!(queue = %queue, error = %err, "failed to release queue lock after claim");
    }

    claimed
}

async fn claim_locked(
    backend: &dyn Backend,
    token: &AuthToken,
    queue: &Subject,
    options: &ClaimOptions,
    metrics: Option<&StoreMetrics>,
) -> StoreResult<Vec<LeasedTask>> {
    let upper = options.upper_ts.unwrap_or_else(Timestamp::now);
    let cells = backend
        .resolve_prefix(token, queue, TASK_ATTRIBUTE_PREFIX, TimestampSpec::Range(0, upper.0))
        .await?;

    let lease_micros = i64::try_from(options.lease.as_micros()).unwrap_or(i64::MAX);
    let future_ts = Timestamp::now().plus_micros(lease_micros);

    let mut claimed = Vec::new();
    let mut rewrites = Vec::new();
    let mut expired = Vec::new();

    for cell in cells {
        if claimed.len() >= options.limit {
            break;
        }
        let Some(bytes) = cell.value.as_bytes() else {
            continue;
        };
        let mut task = decode_task(bytes)?;
        let eta = cell.timestamp;
        let pre_ttl = task.task_ttl;
        task.task_ttl = task.task_ttl.saturating_sub(1);

        if task.task_ttl == 0 {
            expired.push((cell.attribute, TimestampSpec::All));
            if let Some(metrics) = metrics {
                metrics.record_task_ttl_expired();
            }
            continue;
        }

        if pre_ttl != Task::MAX_TTL - 1 {
            if let Some(metrics) = metrics {
                metrics.record_task_retransmission();
            }
        }

        rewrites.push(SetEntry {
            attribute: cell.attribute,
            timestamp: future_ts,
            value: Value::bytes(encode_task(&task)?),
        });
        claimed.push(LeasedTask {
            task,
            eta,
            leased_by: options.leaseholder.clone(),
        });
    }

    if !rewrites.is_empty() || !expired.is_empty() {
        let expired_count = expired.len();
        let to_delete: Vec<Attribute> = expired.into_iter().map(|(attr, _)| attr).collect();
        backend
            .multi_set(token, queue, &rewrites, true, &to_delete)
            .await?;
        if expired_count > 0 {
            info!(queue = %queue, expired_count, "ttl exceeded for queued tasks");
        }
    }

    Ok(claimed)
}

/// Reads tasks from multiple queues without leasing them, grouped by
/// queue and sorted by descending priority within each queue.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn multi_query(
    backend: &dyn Backend,
    token: &AuthToken,
    queues: &[Subject],
) -> StoreResult<HashMap<Subject, Vec<ScheduledTask>>> {
    let results = backend
        .multi_resolve_prefix(token, queues, TASK_ATTRIBUTE_PREFIX, TimestampSpec::All)
        .await?;

    let mut by_queue = HashMap::new();
    for (queue, cells) in results {
        let mut tasks = Vec::with_capacity(cells.len());
        for cell in cells {
            let Some(bytes) = cell.value.as_bytes() else {
                continue;
            };
            tasks.push(ScheduledTask {
                task: decode_task(bytes)?,
                eta: cell.timestamp,
            });
        }
        tasks.sort_by(|a, b| b.task.priority.cmp(&a.task.priority));
        by_queue.insert(queue, tasks);
    }
    Ok(by_queue)
}

/// Reads up to `limit` tasks from a single `queue` without leasing them,
/// sorted by descending priority — a read-only snapshot.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn query_tasks(
    backend: &dyn Backend,
    token: &AuthToken,
    queue: &Subject,
    limit: usize,
) -> StoreResult<Vec<ScheduledTask>> {
    let cells = backend
        .resolve_prefix(token, queue, TASK_ATTRIBUTE_PREFIX, TimestampSpec::All)
        .await?;

    let mut tasks = Vec::with_capacity(cells.len());
    for cell in cells {
        let Some(bytes) = cell.value.as_bytes() else {
            continue;
        };
        tasks.push(ScheduledTask {
            task: decode_task(bytes)?,
            eta: cell.timestamp,
        });
    }
    tasks.sort_by(|a, b| b.task.priority.cmp(&a.task.priority));
    tasks.truncate(limit);
    Ok(tasks)
}

/// Enqueues removal of `tasks` (by id) from `queue`.
pub fn delete_tasks(pool: &mut MutationPool, queue: Subject, task_ids: &[u32]) {
    let attrs = task_ids
        .iter()
        .map(|&id| (task_attribute(id), TimestampSpec::All))
        .collect();
    pool.delete_attributes(queue, attrs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::sync::Arc;

    fn token() -> AuthToken {
        AuthToken::anonymous()
    }

    fn task(queue: &Subject, id: u32, priority: i64) -> Task {
        Task {
            queue: queue.clone(),
            id,
            priority,
            task_ttl: Task::MAX_TTL,
            payload: vec![1, 2, 3],
        }
    }

    fn claim_options(leaseholder: &str) -> ClaimOptions {
        ClaimOptions {
            lease: Duration::from_secs(30),
            limit: 2,
            upper_ts: Some(Timestamp(1_000_001)),
            leaseholder: leaseholder.to_string(),
            retry_interval: Duration::from_millis(1),
            max_wait: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn query_tasks_sorts_by_priority_descending() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let queue = Subject::new("aff4:/C.1234/tasks");
        let mut pool = MutationPool::new(Arc::clone(&backend), token());

        schedule_tasks(
            &mut pool,
            &[task(&queue, 1, 5), task(&queue, 2, 10), task(&queue, 3, 1)],
            Timestamp(1_000_000),
        )
        .unwrap();
        pool.flush().await.unwrap();

        let tasks = query_tasks(backend.as_ref(), &token(), &queue, 2).await.unwrap();
        let ids: Vec<u32> = tasks.iter().map(|t| t.task.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn query_and_own_hides_claimed_tasks_from_subsequent_claims() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let queue = Subject::new("aff4:/C.1234/tasks");
        let mut pool = MutationPool::new(Arc::clone(&backend), token());

        schedule_tasks(
            &mut pool,
            &[task(&queue, 1, 5), task(&queue, 2, 10), task(&queue, 3, 1)],
            Timestamp(1_000_000),
        )
        .unwrap();
        pool.flush().await.unwrap();

        let claimed = query_and_own(backend.as_ref(), &token(), &queue, claim_options("u@h:1"), None)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);

        let second = query_and_own(backend.as_ref(), &token(), &queue, claim_options("u@h:1"), None)
            .await
            .unwrap();
        assert!(second.is_empty(), "claimed tasks must not be re-claimable within the lease");
    }

    #[tokio::test]
    async fn query_and_own_expires_task_ttl_to_zero() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let queue = Subject::new("aff4:/C.1234/tasks");
        let mut pool = MutationPool::new(Arc::clone(&backend), token());

        let mut t = task(&queue, 1, 1);
        t.task_ttl = 1;
        schedule_tasks(&mut pool, &[t], Timestamp(1_000_000)).unwrap();
        pool.flush().await.unwrap();

        let metrics = StoreMetrics::new();
        let claimed = query_and_own(backend.as_ref(), &token(), &queue, claim_options("u@h:1"), Some(&metrics))
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(metrics.task_ttl_expired_count(), 1);

        let cells = backend
            .resolve(&token(), &queue, &[task_attribute(1)], TimestampSpec::All)
            .await
            .unwrap();
        assert!(cells.is_empty());
    }
}
