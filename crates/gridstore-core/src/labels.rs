//! Subject labels: free-form tags attached to a subject as
//! `index:label_<name>` attributes. Presence of the attribute is the
//! label; the stored value is a fixed placeholder, not meaningful data.

use std::collections::HashMap;

use futures::future;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const LABEL_ATTRIBUTE_PREFIX: &str = "index:label_";

/// Placeholder value stored under a label attribute. The label's identity
/// lives entirely in the attribute name; the cell value carries nothing.
const LABEL_PLACEHOLDER_VALUE: &str = "X";

fn label_attribute(label: &str) -> Attribute {
    Attribute::new(format!("{LABEL_ATTRIBUTE_PREFIX}{label}"))
}

/// Enqueues adding `new_labels` to and removing `to_delete` from `subject`
/// in a single combined write, matching the pattern of one `MultiSet` call
/// per label update rather than one per label.
pub fn update_labels(pool: &mut MutationPool, subject: &Subject, new_labels: &[String], to_delete: &[String]) {
    let entries = new_labels
        .iter()
        .map(|name| SetEntry {
            attribute: label_attribute(name),
            timestamp: Timestamp(0),
            value: Value::text(LABEL_PLACEHOLDER_VALUE.to_string()),
        })
        .collect();
    let deletions = to_delete.iter().map(|name| label_attribute(name)).collect();
    pool.multi_set(subject.clone(), entries, false, deletions);
}

/// Reads every label name currently attached to `subject`.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn fetch(backend: &dyn Backend, token: &AuthToken, subject: &Subject) -> StoreResult<Vec<String>> {
    let cells = backend
        .resolve_prefix(token, subject, LABEL_ATTRIBUTE_PREFIX, TimestampSpec::Newest)
        .await?;

    Ok(cells
        .into_iter()
        .filter_map(|cell| cell.attribute.as_str().strip_prefix(LABEL_ATTRIBUTE_PREFIX).map(ToString::to_string))
        .collect())
}

/// As [`fetch`], fanned out across multiple subjects.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn fetch_all(backend: &dyn Backend, token: &AuthToken, subjects: &[Subject]) -> StoreResult<HashMap<Subject, Vec<String>>> {
    let results = future::try_join_all(subjects.iter().map(|subject| fetch(backend, token, subject))).await?;
    Ok(subjects.iter().cloned().zip(results).collect())
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
    async fn update_and_fetch_labels_round_trips() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let subject = Subject::new("aff4:/C.1234");

        update_labels(&mut pool, &subject, &["forensics".to_string(), "active".to_string()], &[]);
        pool.flush().await.unwrap();

        let mut labels = fetch(backend.as_ref(), &token(), &subject).await.unwrap();
        labels.sort();
        assert_eq!(labels, vec!["active".to_string(), "forensics".to_string()]);
    }

    #[tokio::test]
    async fn remove_labels_drops_named_label_only() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let subject = Subject::new("aff4:/C.1234");

        update_labels(&mut pool, &subject, &["forensics".to_string(), "active".to_string()], &[]);
        pool.flush().await.unwrap();

        update_labels(&mut pool, &subject, &[], &["active".to_string()]);
        pool.flush().await.unwrap();

        let labels = fetch(backend.as_ref(), &token(), &subject).await.unwrap();
        assert_eq!(labels, vec!["forensics".to_string()]);
    }

    #[tokio::test]
    async fn update_labels_combines_add_and_delete_in_one_call() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let subject = Subject::new("aff4:/C.1234");

        update_labels(&mut pool, &subject, &["forensics".to_string()], &[]);
        pool.flush().await.unwrap();

        update_labels(&mut pool, &subject, &["active".to_string()], &["forensics".to_string()]);
        pool.flush().await.unwrap();

        let labels = fetch(backend.as_ref(), &token(), &subject).await.unwrap();
        assert_eq!(labels, vec!["active".to_string()]);
    }

    #[tokio::test]
    async fn fetch_all_groups_by_subject() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let subject_a = Subject::new("aff4:/C.1234");
        let subject_b = Subject::new("aff4:/C.5678");

        update_labels(&mut pool, &subject_a, &["forensics".to_string()], &[]);
        pool.flush().await.unwrap();

        let all = fetch_all(backend.as_ref(), &token(), &[subject_a.clone(), subject_b.clone()])
            .await
            .unwrap();
        assert_eq!(all[&subject_a].len(), 1);
        assert!(all[&subject_b].is_empty());
    }
}
