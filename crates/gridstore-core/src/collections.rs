//! Sequential collections: append-only record sequences addressed by
//! `<base>/<subpath>/<16-hex-ts>.<6-hex-suffix>`.
//!
//! Task queues (§4.5) and records queues (§4.6) both build on the same
//! URN layout as the user-facing `Results` collection; this module owns
//! the URN scheme and the read/delete side, while callers with
//! different subpaths (`queue.rs`, `records.rs`) reuse [`make_urn`]
//! directly.

use futures::StreamExt;
use rand::Rng;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

/// The default subpath user-facing collections are stored under.
pub const DEFAULT_SUBPATH: &str = "Results";

/// The attribute a collection record's payload is stored under.
pub const SEQUENTIAL_VALUE_ATTRIBUTE: &str = "aff4:sequential_value";

/// Prefix for the per-base record-count index attribute `index:sc_<i>`.
pub const INDEX_ATTRIBUTE_PREFIX: &str = "index:sc_";

/// Prefix for the stored-type marker attribute `aff4:value_type_<type>`.
pub const VALUE_TYPE_ATTRIBUTE_PREFIX: &str = "aff4:value_type_";

/// The largest suffix expressible in 6 hex digits; also the sentinel used
/// to bound a scan to "strictly after this timestamp, any suffix".
pub const MAX_SUFFIX: u32 = 0x00FF_FFFF;

fn sequential_value_attribute() -> Attribute {
    Attribute::new(SEQUENTIAL_VALUE_ATTRIBUTE)
}

/// Builds the composite subject a record lives at, choosing a uniformly
/// random 24-bit suffix in `[1, 0xFFFFFF]` when `suffix` is `None`.
///
/// Collisions between two writers picking the same `(timestamp, suffix)`
/// pair within the same microsecond are possible and not detected; see
/// `DESIGN.md` for why this mirrors the original's behavior unchanged.
#[must_use]
pub fn make_urn(base: &Subject, timestamp: Timestamp, suffix: Option<u32>, subpath: &str) -> (Subject, Timestamp, u32) {
    let suffix = suffix.unwrap_or_else(|| rand::thread_rng().gen_range(1..=MAX_SUFFIX));
    let subject = base
        .child(subpath)
        .child(format!("{:016x}.{:06x}", timestamp.0, suffix));
    (subject, timestamp, suffix)
}

/// Parses the trailing 6 hex digits of a record subject as its suffix.
#[must_use]
pub fn suffix_of(subject: &Subject) -> Option<u32> {
    let raw = subject.as_str();
    if raw.len() < 6 {
        return None;
    }
    u32::from_str_radix(&raw[raw.len() - 6..], 16).ok()
}

/// Enqueues a record write at `base`'s `Results` subpath (or whatever
/// `subpath` the caller names, for `queue.rs`'s `Records` use).
///
/// Returns the composite subject, timestamp and suffix actually used.
pub fn add_item(
    pool: &mut MutationPool,
    base: &Subject,
    item: &[u8],
    timestamp: Timestamp,
    suffix: Option<u32>,
    subpath: &str,
    replace: bool,
) -> (Subject, Timestamp, u32) {
    let (subject, timestamp, suffix) = make_urn(base, timestamp, suffix, subpath);
    pool.multi_set(
        subject.clone(),
        vec![SetEntry {
            attribute: sequential_value_attribute(),
            timestamp,
            value: Value::bytes(item.to_vec()),
        }],
        replace,
        Vec::new(),
    );
    (subject, timestamp, suffix)
}

/// Enqueues the per-base record-count index entry `index:sc_<i>` for the
/// `i`-th logical record, recording its 6-hex suffix.
pub fn add_index(pool: &mut MutationPool, base: &Subject, index: u32, timestamp: Timestamp, suffix: u32) {
    pool.set(
        base.clone(),
        SetEntry {
            attribute: Attribute::new(format!("{INDEX_ATTRIBUTE_PREFIX}{index:08x}")),
            timestamp,
            value: Value::text(format!("{suffix:06x}")),
        },
    );
}

/// Enqueues the stored-type marker `aff4:value_type_<type>` at timestamp
/// zero, recording which record type lives in this collection.
pub fn add_stored_type_index(pool: &mut MutationPool, base: &Subject, stored_type: &str) {
    pool.set(
        base.clone(),
        SetEntry {
            attribute: Attribute::new(format!("{VALUE_TYPE_ATTRIBUTE_PREFIX}{stored_type}")),
            timestamp: Timestamp(0),
            value: Value::Integer(1),
        },
    );
}

/// One record read back by [`scan_items`].
#[derive(Debug, Clone)]
pub struct CollectionItem {
    /// The record's opaque payload.
    pub value: Vec<u8>,
    /// The record's timestamp.
    pub timestamp: Timestamp,
    /// The record's 24-bit suffix.
    pub suffix: u32,
}

/// Reads records from `<base>/Results` in ascending `(timestamp, suffix)`
/// order, optionally starting strictly after `(after_ts, after_suffix)`
/// and capped at `limit` records.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn scan_items(
    backend: &dyn Backend,
    token: &AuthToken,
    base: &Subject,
    after_ts: Option<Timestamp>,
    after_suffix: Option<u32>,
    limit: Option<usize>,
) -> StoreResult<Vec<CollectionItem>> {
    let root = base.child(DEFAULT_SUBPATH);
    let after_urn = after_ts.map(|ts| make_urn(base, ts, Some(after_suffix.unwrap_or(MAX_SUFFIX)), DEFAULT_SUBPATH).0);
    let attribute = sequential_value_attribute();

    let mut stream = backend.scan_attributes(
        token,
        &root,
        std::slice::from_ref(&attribute),
        after_urn.as_ref(),
        limit,
        false,
    );

    let mut items = Vec::new();
    while let Some(row) = stream.next().await {
        let (subject, cells) = row?;
        let Some(cell) = cells.into_iter().find(|c| c.attribute == attribute) else {
            continue;
        };
        let Some(suffix) = suffix_of(&subject) else {
            continue;
        };
        items.push(CollectionItem {
            value: cell.value.as_bytes().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: cell.timestamp,
            suffix,
        });
    }
    Ok(items)
}

/// Deletes every record under `<base>/Results`, enqueuing subject
/// deletions into `pool` and auto-flushing every
/// [`crate::pool::AUTO_FLUSH_THRESHOLD`] items so a large collection
/// doesn't grow the pool unbounded.
///
/// # Errors
///
/// Propagates backend errors from the scan or from an auto-flush.
pub async fn delete(pool: &mut MutationPool, backend: &dyn Backend, token: &AuthToken, base: &Subject) -> StoreResult<()> {
    let root = base.child(DEFAULT_SUBPATH);
    let attribute = sequential_value_attribute();
    let mut stream = backend.scan_attributes(token, &root, std::slice::from_ref(&attribute), None, None, true);

    while let Some(row) = stream.next().await {
        let (subject, _) = row?;
        pool.delete_subject(subject);
        if pool.should_auto_flush() {
            pool.flush().await?;
        }
    }
    Ok(())
}
