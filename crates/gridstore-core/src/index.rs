//! Keyword indexes.
//!
//! A keyword index maps `keyword -> {names}` by writing a
//! `kw_index:<name>` attribute on the `(index_urn, keyword)` subject —
//! the subject itself encodes the keyword, so querying a keyword is a
//! direct subject lookup rather than a scan.

use std::collections::{HashMap, HashSet};

use futures::future;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const POSTING_ATTRIBUTE_PREFIX: &str = "kw_index:";

fn keyword_subject(index_urn: &Subject, keyword: &str) -> Subject {
    index_urn.child(keyword)
}

fn posting_attribute(name: &str) -> Attribute {
    Attribute::new(format!("{POSTING_ATTRIBUTE_PREFIX}{name}"))
}

/// Enqueues a posting of `name` under every keyword in `keywords`,
/// within the index rooted at `index_urn`.
pub fn add_keywords_for_name(pool: &mut MutationPool, index_urn: &Subject, name: &str, keywords: &[String], timestamp: Timestamp) {
    for keyword in keywords {
        pool.set(
            keyword_subject(index_urn, keyword),
            SetEntry {
                attribute: posting_attribute(name),
                timestamp,
                value: Value::Integer(1),
            },
        );
    }
}

/// Enqueues removal of `name`'s posting under every keyword in
/// `keywords`.
pub fn remove_keywords_for_name(pool: &mut MutationPool, index_urn: &Subject, name: &str, keywords: &[String]) {
    for keyword in keywords {
        pool.delete_attributes(keyword_subject(index_urn, keyword), vec![(posting_attribute(name), TimestampSpec::All)]);
    }
}

/// Reads the posting list for each keyword in `keywords`, restricted to
/// postings written in `[start, end]` inclusive, returning the set of
/// names posted under it.
///
/// When `last_seen_map` is given, every `(keyword, name)` pair is
/// recorded with the latest posting timestamp seen for it — taking the
/// max against whatever was already in the map — letting a caller poll
/// this repeatedly and track how far it has indexed without re-scanning
/// from the beginning.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn read_posting_lists(
    backend: &dyn Backend,
    token: &AuthToken,
    index_urn: &Subject,
    keywords: &[String],
    start: Timestamp,
    end: Timestamp,
    last_seen_map: Option<&mut HashMap<(String, String), Timestamp>>,
) -> StoreResult<HashMap<String, HashSet<String>>> {
    let subjects: Vec<Subject> = keywords.iter().map(|keyword| keyword_subject(index_urn, keyword)).collect();
    // The backend range is inclusive on both ends; widen to `end + 1` so a
    // posting written at exactly `end` is not dropped, matching the
    // original's `timestamp=(start_time, end_time + 1)`.
    let spec = TimestampSpec::Range(start.0, end.0 + 1);

    let results = future::try_join_all(subjects.iter().map(|subject| {
        backend.resolve_prefix(token, subject, POSTING_ATTRIBUTE_PREFIX, spec)
    }))
    .await?;

    let mut last_seen_map = last_seen_map;
    let mut postings: HashMap<String, HashSet<String>> = keywords.iter().cloned().map(|keyword| (keyword, HashSet::new())).collect();
    for (keyword, cells) in keywords.iter().zip(results) {
        for cell in cells {
            let Some(name) = cell.attribute.as_str().strip_prefix(POSTING_ATTRIBUTE_PREFIX) else {
                continue;
            };
            if let Some(last_seen_map) = last_seen_map.as_deref_mut() {
                let key = (keyword.clone(), name.to_string());
                let seen = last_seen_map.entry(key).or_insert(Timestamp(-1));
                if cell.timestamp > *seen {
                    *seen = cell.timestamp;
                }
            }
            postings.entry(keyword.clone()).or_default().insert(name.to_string());
        }
    }
    Ok(postings)
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
    async fn add_and_read_posting_lists_groups_by_keyword() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let index = Subject::new("aff4:/client_index");

        add_keywords_for_name(&mut pool, &index, "C.1234", &["linux".to_string(), "prod".to_string()], Timestamp(1));
        add_keywords_for_name(&mut pool, &index, "C.5678", &["linux".to_string()], Timestamp(1));
        pool.flush().await.unwrap();

        let postings = read_posting_lists(
            backend.as_ref(),
            &token(),
            &index,
            &["linux".to_string(), "prod".to_string()],
            Timestamp(0),
            Timestamp::now(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(postings["linux"].len(), 2);
        assert_eq!(postings["prod"].len(), 1);
    }

    #[tokio::test]
    async fn remove_keywords_for_name_drops_posting() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let index = Subject::new("aff4:/client_index");

        add_keywords_for_name(&mut pool, &index, "C.1234", &["linux".to_string()], Timestamp(1));
        pool.flush().await.unwrap();

        remove_keywords_for_name(&mut pool, &index, "C.1234", &["linux".to_string()]);
        pool.flush().await.unwrap();

        let postings = read_posting_lists(backend.as_ref(), &token(), &index, &["linux".to_string()], Timestamp(0), Timestamp::now(), None)
            .await
            .unwrap();
        assert!(postings["linux"].is_empty());
    }

    #[tokio::test]
    async fn start_end_range_excludes_postings_outside_window() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let index = Subject::new("aff4:/client_index");

        add_keywords_for_name(&mut pool, &index, "C.1234", &["linux".to_string()], Timestamp(5));
        pool.flush().await.unwrap();

        let postings = read_posting_lists(backend.as_ref(), &token(), &index, &["linux".to_string()], Timestamp(10), Timestamp(20), None)
            .await
            .unwrap();
        assert!(postings["linux"].is_empty());
    }

    #[tokio::test]
    async fn end_boundary_is_inclusive_of_end_plus_one() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let index = Subject::new("aff4:/client_index");

        // Posted exactly one tick past `end`: the range must still include it.
        add_keywords_for_name(&mut pool, &index, "C.1234", &["linux".to_string()], Timestamp(21));
        pool.flush().await.unwrap();

        let postings = read_posting_lists(backend.as_ref(), &token(), &index, &["linux".to_string()], Timestamp(10), Timestamp(20), None)
            .await
            .unwrap();
        assert_eq!(postings["linux"].len(), 1, "a posting at end+1 must be included");
    }

    #[tokio::test]
    async fn last_seen_map_tracks_max_posting_timestamp() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let index = Subject::new("aff4:/client_index");

        add_keywords_for_name(&mut pool, &index, "C.1234", &["linux".to_string()], Timestamp(5));
        pool.flush().await.unwrap();

        let mut last_seen = HashMap::new();
        last_seen.insert(("linux".to_string(), "C.1234".to_string()), Timestamp(3));

        let postings = read_posting_lists(
            backend.as_ref(),
            &token(),
            &index,
            &["linux".to_string()],
            Timestamp(0),
            Timestamp::now(),
            Some(&mut last_seen),
        )
        .await
        .unwrap();
        assert_eq!(postings["linux"].len(), 1, "a populated last_seen_map no longer filters results");
        assert_eq!(last_seen[&("linux".to_string(), "C.1234".to_string())], Timestamp(5), "map is bumped to the newest posting seen");
    }
}
