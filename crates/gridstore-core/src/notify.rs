//! Session notifications.
//!
//! A notification is a `notify:<session_id>` attribute written to a
//! queue-shard subject, with `replace=false` so that notifications from
//! independent writers accumulate as distinct-timestamp cells rather
//! than clobbering one another — this is the one write path in the
//! store that goes through [`MutationPool::notify`] instead of
//! [`MutationPool::multi_set`], so it is flushed last, after every other
//! pending mutation has landed.

use futures::future;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::{StoreError, StoreResult};
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const NOTIFY_ATTRIBUTE_PREFIX: &str = "notify:";

fn notify_attribute(session_id: &Subject) -> Attribute {
    Attribute::new(format!("{NOTIFY_ATTRIBUTE_PREFIX}{session_id}"))
}

/// A notification payload: which session has new work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// The session the notification concerns.
    pub session_id: Subject,
    /// Caller-serialized payload describing the work.
    pub payload: Vec<u8>,
}

fn encode(notification: &Notification) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(notification).map_err(|err| StoreError::InvalidArgument(format!("encoding notification: {err}")))
}

fn decode(bytes: &[u8]) -> StoreResult<Notification> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::InvalidArgument(format!("decoding notification: {err}")))
}

/// Enqueues one notification per entry in `notifications` on `shard`, at
/// the current time.
///
/// # Errors
///
/// Returns [`StoreError::InvalidArgument`] if a notification fails to
/// serialize.
pub fn create_notifications(pool: &mut MutationPool, shard: &Subject, notifications: &[Notification]) -> StoreResult<()> {
    for notification in notifications {
        pool.notify(
            shard.clone(),
            SetEntry {
                attribute: notify_attribute(&notification.session_id),
                timestamp: Timestamp::now(),
                value: Value::bytes(encode(notification)?),
            },
        );
    }
    Ok(())
}

/// Reads notifications currently on `shard` with timestamp `<= end_ts`,
/// capped at `limit`, in the backend's `resolve_prefix` order (no
/// further sort is applied).
///
/// Cells whose payload fails to deserialize are treated as malformed: a
/// narrow deletion scoped to just that cell's own timestamp (`[ts, ts]`)
/// is issued directly against the backend (bypassing the pool, since this
/// cleanup must be visible before the next read) and the cell is skipped
/// rather than failing the whole read.
///
/// # Errors
///
/// Propagates backend errors other than malformed-cell deserialization
/// failures.
pub async fn get_notifications(
    backend: &dyn Backend,
    token: &AuthToken,
    shard: &Subject,
    end_ts: Timestamp,
    limit: usize,
) -> StoreResult<Vec<Notification>> {
    let cells = backend
        .resolve_prefix(token, shard, NOTIFY_ATTRIBUTE_PREFIX, TimestampSpec::Range(0, end_ts.0))
        .await?;

    let mut notifications = Vec::with_capacity(cells.len().min(limit));
    let mut malformed = Vec::new();

    for cell in cells {
        if notifications.len() >= limit {
            break;
        }
        let Some(bytes) = cell.value.as_bytes() else {
            malformed.push((cell.attribute, cell.timestamp));
            continue;
        };
        match decode(bytes) {
            Ok(notification) => notifications.push(notification),
            Err(err) => {
                warn!(shard = %shard, attribute = %cell.attribute, error = %err, "dropping malformed notification cell");
                malformed.push((cell.attribute, cell.timestamp));
            }
        }
    }

    for (attribute, ts) in malformed {
        backend
            .delete_attributes(token, shard, &[(attribute, TimestampSpec::Range(ts.0, ts.0))])
            .await?;
    }

    Ok(notifications)
}

/// As [`get_notifications`], fanned out across multiple shards.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn get_notifications_multi(
    backend: &dyn Backend,
    token: &AuthToken,
    shards: &[Subject],
    end_ts: Timestamp,
    limit: usize,
) -> StoreResult<Vec<Notification>> {
    let mut notifications: Vec<Notification> =
        future::try_join_all(shards.iter().map(|shard| get_notifications(backend, token, shard, end_ts, limit)))
            .await?
            .into_iter()
            .flatten()
            .collect();
    notifications.truncate(limit);
    Ok(notifications)
}

/// Enqueues a ranged removal of every notification for each of
/// `session_ids` from each of `shards`, restricted to `[start, end]`.
pub fn delete_notifications(pool: &mut MutationPool, shards: &[Subject], session_ids: &[Subject], start: Timestamp, end: Timestamp) {
    let attrs: Vec<(Attribute, TimestampSpec)> = session_ids
        .iter()
        .map(|session_id| (notify_attribute(session_id), TimestampSpec::Range(start.0, end.0)))
        .collect();
    for shard in shards {
        pool.delete_attributes(shard.clone(), attrs.clone());
    }
}
