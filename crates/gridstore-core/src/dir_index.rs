//! Directory-child index: a filesystem-shaped subject's children are
//! recorded as `index:dir/<child>` attributes on the parent, so listing
//! a directory never needs a prefix scan over the child subjects
//! themselves.

use std::collections::HashMap;

use futures::future;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const CHILD_ATTRIBUTE_PREFIX: &str = "index:dir/";

fn child_attribute(child_name: &str) -> Attribute {
    Attribute::new(format!("{CHILD_ATTRIBUTE_PREFIX}{child_name}"))
}

/// Enqueues recording `child_name` as a child of `parent`.
pub fn add_child(pool: &mut MutationPool, parent: &Subject, child_name: &str, timestamp: Timestamp) {
    pool.set(
        parent.clone(),
        SetEntry {
            attribute: child_attribute(child_name),
            timestamp,
            value: Value::Integer(1),
        },
    );
}

/// Enqueues removal of `child_name` from `parent`'s child index.
pub fn delete_child(pool: &mut MutationPool, parent: &Subject, child_name: &str) {
    pool.delete_attributes(parent.clone(), vec![(child_attribute(child_name), TimestampSpec::All)]);
}

/// Reads the names of every child recorded under `parent`.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn fetch_children(backend: &dyn Backend, token: &AuthToken, parent: &Subject) -> StoreResult<Vec<String>> {
    let cells = backend
        .resolve_prefix(token, parent, CHILD_ATTRIBUTE_PREFIX, TimestampSpec::Newest)
        .await?;

    Ok(cells
        .into_iter()
        .filter_map(|cell| cell.attribute.as_str().strip_prefix(CHILD_ATTRIBUTE_PREFIX).map(ToString::to_string))
        .collect())
}

/// As [`fetch_children`], fanned out across multiple parents.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn multi_fetch_children(backend: &dyn Backend, token: &AuthToken, parents: &[Subject]) -> StoreResult<HashMap<Subject, Vec<String>>> {
    let results = future::try_join_all(parents.iter().map(|parent| fetch_children(backend, token, parent))).await?;
    Ok(parents.iter().cloned().zip(results).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::sync::Arc;

    fn token() -> AuthToken {
        AuthToken::anonymous()
    }

    #[tokio::test]
    async fn add_child_and_fetch_children_round_trips() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let parent = Subject::new("aff4:/C.1234/fs/os/bin");

        add_child(&mut pool, &parent, "ls", Timestamp(1));
        add_child(&mut pool, &parent, "cat", Timestamp(1));
        pool.flush().await.unwrap();

        let mut children = fetch_children(backend.as_ref(), &token(), &parent).await.unwrap();
        children.sort();
        assert_eq!(children, vec!["cat".to_string(), "ls".to_string()]);
    }

    #[tokio::test]
    async fn delete_child_removes_single_entry() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let parent = Subject::new("aff4:/C.1234/fs/os/bin");

        add_child(&mut pool, &parent, "ls", Timestamp(1));
        add_child(&mut pool, &parent, "cat", Timestamp(1));
        pool.flush().await.unwrap();

        delete_child(&mut pool, &parent, "cat");
        pool.flush().await.unwrap();

        let children = fetch_children(backend.as_ref(), &token(), &parent).await.unwrap();
        assert_eq!(children, vec!["ls".to_string()]);
    }

    #[tokio::test]
    async fn multi_fetch_children_groups_by_parent() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let bin = Subject::new("aff4:/C.1234/fs/os/bin");
        let etc = Subject::new("aff4:/C.1234/fs/os/etc");

        add_child(&mut pool, &bin, "ls", Timestamp(1));
        pool.flush().await.unwrap();

        let all = multi_fetch_children(backend.as_ref(), &token(), &[bin.clone(), etc.clone()])
            .await
            .unwrap();
        assert_eq!(all[&bin].len(), 1);
        assert!(all[&etc].is_empty());
    }
}
