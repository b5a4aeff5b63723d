//! File-hash index: maps a content hash to the file paths known to carry
//! it, via a `hash_index:<hash>` subject holding one
//! `index:target:<lowercased path>` attribute per match. The attribute
//! name carries only a normalized lookup key; the matched path itself —
//! in its original case — is the cell's value.

use std::collections::HashMap;

use futures::future;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const TARGET_ATTRIBUTE_PREFIX: &str = "index:target:";

fn hash_index_subject(root: &Subject, hash: &str) -> Subject {
    root.child(hash)
}

fn target_attribute(target_path: &str) -> Attribute {
    Attribute::new(format!("{TARGET_ATTRIBUTE_PREFIX}{}", target_path.to_lowercase()))
}

/// How many matches a [`query`] call should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLimit {
    /// Return at most `0` counted from the first match.
    Count(usize),
    /// Return up to `length` matches starting at the `start`-th one.
    Window {
        /// Zero-based offset of the first match to return.
        start: usize,
        /// Maximum number of matches to return.
        length: usize,
    },
}

impl QueryLimit {
    fn apply<T>(self, items: Vec<T>) -> Vec<T> {
        match self {
            QueryLimit::Count(count) => items.into_iter().take(count).collect(),
            QueryLimit::Window { start, length } => items.into_iter().skip(start).take(length).collect(),
        }
    }
}

/// Enqueues recording that `target_path` carries content hash `hash`,
/// indexed under `root`. The attribute name is the lowercased path; the
/// value is the path as given.
pub fn add_item(pool: &mut MutationPool, root: &Subject, hash: &str, target_path: &str, timestamp: Timestamp) {
    pool.set(
        hash_index_subject(root, hash),
        SetEntry {
            attribute: target_attribute(target_path),
            timestamp,
            value: Value::text(target_path.to_string()),
        },
    );
}

/// Reads every path known to carry content hash `hash` under `root` whose
/// lowercased form starts with `target_prefix`, bounded by `limit`.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn query(
    backend: &dyn Backend,
    token: &AuthToken,
    root: &Subject,
    hash: &str,
    target_prefix: &str,
    limit: QueryLimit,
) -> StoreResult<Vec<String>> {
    let prefix = format!("{TARGET_ATTRIBUTE_PREFIX}{}", target_prefix.to_lowercase());
    let cells = backend
        .resolve_prefix(token, &hash_index_subject(root, hash), &prefix, TimestampSpec::Newest)
        .await?;

    let hits: Vec<String> = cells.into_iter().filter_map(|cell| cell.value.as_text().map(ToString::to_string)).collect();
    Ok(limit.apply(hits))
}

/// Broadly resolves every match under `root` across `hashes`, without a
/// target-prefix restriction (bare `index:target:` prefix scan per hash).
///
/// # Errors
///
/// Propagates backend errors.
pub async fn query_multiple(backend: &dyn Backend, token: &AuthToken, root: &Subject, hashes: &[String]) -> StoreResult<HashMap<String, Vec<String>>> {
    let results = future::try_join_all(hashes.iter().map(|hash| async move {
        let cells = backend
            .resolve_prefix(token, &hash_index_subject(root, hash), TARGET_ATTRIBUTE_PREFIX, TimestampSpec::Newest)
            .await?;
        StoreResult::Ok(cells.into_iter().filter_map(|cell| cell.value.as_text().map(ToString::to_string)).collect::<Vec<_>>())
    }))
    .await?;
    Ok(hashes.iter().cloned().zip(results).collect())
}
