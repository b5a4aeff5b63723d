//! Flow request/response tracking.
//!
//! A flow's requests and responses are stored as cells on two related
//! subjects: `<session_id>/state` holds one `flow:request:<8-hex-id>`
//! attribute per outstanding request (the request's own serialized
//! state) and one `flow:status:<8-hex-id>` attribute per request that
//! has reached a terminal status, while
//! `<session_id>/state/request:<8-hex-id>` holds the responses that
//! request has collected so far, one `flow:response:<8-hex-id>:<8-hex-seq>`
//! attribute per response.

use std::collections::{HashMap, HashSet};

use futures::future;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::backend::SetEntry;
use crate::config::AuthToken;
use crate::error::{StoreError, StoreResult};
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const REQUEST_ATTRIBUTE_PREFIX: &str = "flow:request:";
const RESPONSE_ATTRIBUTE_PREFIX: &str = "flow:response:";
const STATUS_ATTRIBUTE_PREFIX: &str = "flow:status:";

fn state_subject(session_id: &Subject) -> Subject {
    session_id.child("state")
}

fn request_subject(session_id: &Subject, request_id: u32) -> Subject {
    state_subject(session_id).child(format!("request:{request_id:08X}"))
}

fn request_attribute(request_id: u32) -> Attribute {
    Attribute::new(format!("{REQUEST_ATTRIBUTE_PREFIX}{request_id:08X}"))
}

fn response_attribute(request_id: u32, response_id: u32) -> Attribute {
    Attribute::new(format!("{RESPONSE_ATTRIBUTE_PREFIX}{request_id:08X}:{response_id:08X}"))
}

fn status_attribute(request_id: u32) -> Attribute {
    Attribute::new(format!("{STATUS_ATTRIBUTE_PREFIX}{request_id:08X}"))
}

/// One outstanding request's serialized state, opaque to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    /// The request's id within its session.
    pub request_id: u32,
    /// Caller-serialized request state.
    pub payload: Vec<u8>,
}

/// One response collected against a [`FlowRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResponse {
    /// The id of the request this response answers.
    pub request_id: u32,
    /// The response's sequence number within its request.
    pub response_id: u32,
    /// Caller-serialized response payload, or `None` for a status-only
    /// terminator response.
    pub payload: Option<Vec<u8>>,
    /// Whether this response carries the terminal status marker for its
    /// request — when set, it is additionally indexed on the `state`
    /// subject so completion can be checked without scanning responses.
    pub is_status: bool,
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| StoreError::InvalidArgument(format!("encoding flow state: {err}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::InvalidArgument(format!("decoding flow state: {err}")))
}

/// Enqueues `new_requests`, `new_responses` and the removal of
/// `requests_to_delete`, all under `session_id`, grouping every mutation
/// by the subject it lands on and issuing exactly one `multi_set` per
/// affected subject so a request's deletion and a fresh write to the
/// same subject land atomically in that one pool operation — matching
/// `labels.rs`'s `update_labels`, which folds new and removed labels
/// into the same `multi_set` call rather than two separate ones.
///
/// Each request in `new_requests` is paired with the timestamp its
/// `flow:request:<id>` cell is written at; each response in
/// `new_responses` likewise carries its own timestamp. A response with
/// `is_status` set additionally lands a `flow:status:<id>` cell on the
/// `state` subject. `requests_to_delete` names request ids whose
/// `flow:request:<id>` and `flow:status:<id>` attributes on `state`
/// should be cleared.
pub fn store_requests_and_responses(
    pool: &mut MutationPool,
    session_id: &Subject,
    new_requests: &[(FlowRequest, Timestamp)],
    new_responses: &[(FlowResponse, Timestamp)],
    requests_to_delete: &[u32],
) -> StoreResult<()> {
    let mut to_write: HashMap<Subject, Vec<SetEntry>> = HashMap::new();

    for (request, timestamp) in new_requests {
        to_write.entry(state_subject(session_id)).or_default().push(SetEntry {
            attribute: request_attribute(request.request_id),
            timestamp: *timestamp,
            value: Value::bytes(encode(request)?),
        });
    }

    for (response, timestamp) in new_responses {
        if response.is_status {
            to_write.entry(state_subject(session_id)).or_default().push(SetEntry {
                attribute: status_attribute(response.request_id),
                timestamp: *timestamp,
                value: Value::bytes(encode(response)?),
            });
        }
        to_write
            .entry(request_subject(session_id, response.request_id))
            .or_default()
            .push(SetEntry {
                attribute: response_attribute(response.request_id, response.response_id),
                timestamp: *timestamp,
                value: Value::bytes(encode(response)?),
            });
    }

    let mut to_delete: HashMap<Subject, Vec<Attribute>> = HashMap::new();
    for &request_id in requests_to_delete {
        let attrs = to_delete.entry(state_subject(session_id)).or_default();
        attrs.push(request_attribute(request_id));
        attrs.push(status_attribute(request_id));
    }

    let subjects: HashSet<Subject> = to_write.keys().cloned().chain(to_delete.keys().cloned()).collect();
    for subject in subjects {
        let entries = to_write.remove(&subject).unwrap_or_default();
        let deletes = to_delete.remove(&subject).unwrap_or_default();
        pool.multi_set(subject, entries, false, deletes);
    }
    Ok(())
}

/// Reads every response collected for `request_id` under `session_id`,
/// in ascending sequence order.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn read_responses(
    backend: &dyn Backend,
    token: &AuthToken,
    session_id: &Subject,
    request_id: u32,
) -> StoreResult<Vec<FlowResponse>> {
    read_responses_for_request_id(backend, token, session_id, request_id).await
}

/// As [`read_responses`]; named to mirror the supplemental read path
/// that fetches by an explicit request id rather than the whole session.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn read_responses_for_request_id(
    backend: &dyn Backend,
    token: &AuthToken,
    session_id: &Subject,
    request_id: u32,
) -> StoreResult<Vec<FlowResponse>> {
    let cells = backend
        .resolve_prefix(
            token,
            &request_subject(session_id, request_id),
            RESPONSE_ATTRIBUTE_PREFIX,
            TimestampSpec::All,
        )
        .await?;

    let mut responses = cells
        .into_iter()
        .filter_map(|cell| cell.value.as_bytes().map(<[u8]>::to_vec))
        .map(|bytes| decode::<FlowResponse>(&bytes))
        .collect::<StoreResult<Vec<_>>>()?;
    responses.sort_by_key(|response| response.response_id);
    Ok(responses)
}

/// Reads every outstanding request under `session_id` together with the
/// responses collected so far for each, keyed by request id.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn read_requests_and_responses(
    backend: &dyn Backend,
    token: &AuthToken,
    session_id: &Subject,
) -> StoreResult<HashMap<u32, (FlowRequest, Vec<FlowResponse>)>> {
    let request_cells = backend
        .resolve_prefix(token, &state_subject(session_id), REQUEST_ATTRIBUTE_PREFIX, TimestampSpec::Newest)
        .await?;

    let requests = request_cells
        .into_iter()
        .filter_map(|cell| cell.value.as_bytes().map(<[u8]>::to_vec))
        .map(|bytes| decode::<FlowRequest>(&bytes))
        .collect::<StoreResult<Vec<_>>>()?;

    let responses = future::try_join_all(
        requests
            .iter()
            .map(|request| read_responses_for_request_id(backend, token, session_id, request.request_id)),
    )
    .await?;

    Ok(requests
        .into_iter()
        .zip(responses)
        .map(|(request, responses)| (request.request_id, (request, responses)))
        .collect())
}

/// Checks which of `request_ids` have a terminal `flow:status:<id>` cell
/// recorded on the `state` subject, returning the completed subset.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn check_requests_for_completion(
    backend: &dyn Backend,
    token: &AuthToken,
    session_id: &Subject,
    request_ids: &[u32],
) -> StoreResult<Vec<u32>> {
    let attributes: Vec<Attribute> = request_ids.iter().map(|&id| status_attribute(id)).collect();
    let cells = backend.resolve(token, &state_subject(session_id), &attributes, TimestampSpec::Newest).await?;

    let present: HashSet<Attribute> = cells.into_iter().map(|cell| cell.attribute).collect();
    Ok(request_ids
        .iter()
        .copied()
        .filter(|&id| present.contains(&status_attribute(id)))
        .collect())
}

/// Reads every request under `session_id` that has reached a terminal
/// `flow:status:<id>` response, paired with that terminal response.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn read_completed_requests(
    backend: &dyn Backend,
    token: &AuthToken,
    session_id: &Subject,
) -> StoreResult<Vec<(FlowRequest, FlowResponse)>> {
    let all = read_requests_and_responses(backend, token, session_id).await?;
    let request_ids: Vec<u32> = all.keys().copied().collect();
    let attributes: Vec<Attribute> = request_ids.iter().map(|&id| status_attribute(id)).collect();
    let status_cells = backend.resolve(token, &state_subject(session_id), &attributes, TimestampSpec::Newest).await?;

    status_cells
        .into_iter()
        .filter_map(|cell| {
            let request_id = cell.attribute.as_str().strip_prefix(STATUS_ATTRIBUTE_PREFIX)?;
            let request_id = u32::from_str_radix(request_id, 16).ok()?;
            let (request, _) = all.get(&request_id)?;
            let bytes = cell.value.as_bytes()?;
            Some(decode::<FlowResponse>(bytes).map(|terminal| (request.clone(), terminal)))
        })
        .collect()
}

/// Enqueues removal of `request_ids` (and their response subjects) from
/// `session_id`.
pub fn delete_requests(pool: &mut MutationPool, session_id: &Subject, request_ids: &[u32]) {
    let attrs = request_ids
        .iter()
        .flat_map(|&id| [(request_attribute(id), TimestampSpec::All), (status_attribute(id), TimestampSpec::All)])
        .collect();
    pool.delete_attributes(state_subject(session_id), attrs);
    pool.delete_subjects(request_ids.iter().map(|&id| request_subject(session_id, id)));
}

/// Tears down every flow state subject under `session_id` for each
/// session in `session_ids`: enumerates the outstanding requests on each
/// `state` subject, enqueues deletion of their response subjects plus
/// the `state` and session subjects themselves, and returns every
/// deleted request keyed by its session.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn multi_destroy_flow_states(
    backend: &dyn Backend,
    token: &AuthToken,
    pool: &mut MutationPool,
    session_ids: &[Subject],
) -> StoreResult<Vec<(Subject, FlowRequest)>> {
    let per_session = future::try_join_all(session_ids.iter().map(|session_id| async move {
        let cells = backend
            .resolve_prefix(token, &state_subject(session_id), REQUEST_ATTRIBUTE_PREFIX, TimestampSpec::Newest)
            .await?;
        let requests = cells
            .into_iter()
            .filter_map(|cell| cell.value.as_bytes().map(<[u8]>::to_vec))
            .map(|bytes| decode::<FlowRequest>(&bytes))
            .collect::<StoreResult<Vec<_>>>()?;
        StoreResult::Ok((session_id.clone(), requests))
    }))
    .await?;

    let mut subjects_to_delete = Vec::with_capacity(session_ids.len() * 2);
    let mut deleted = Vec::new();
    for (session_id, requests) in per_session {
        for request in &requests {
            subjects_to_delete.push(request_subject(&session_id, request.request_id));
        }
        subjects_to_delete.push(state_subject(&session_id));
        subjects_to_delete.push(session_id.clone());
        deleted.extend(requests.into_iter().map(|request| (session_id.clone(), request)));
    }
    pool.delete_subjects(subjects_to_delete);

    Ok(deleted)
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
    async fn store_and_read_round_trips_request_and_responses() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let session = Subject::new("aff4:/C.1234/flows/F:ABCD");

        let request = FlowRequest {
            request_id: 1,
            payload: b"req".to_vec(),
        };
        let responses = vec![
            (
                FlowResponse {
                    request_id: 1,
                    response_id: 0,
                    payload: Some(b"r0".to_vec()),
                    is_status: false,
                },
                Timestamp(1),
            ),
            (
                FlowResponse {
                    request_id: 1,
                    response_id: 1,
                    payload: Some(b"r1".to_vec()),
                    is_status: false,
                },
                Timestamp(1),
            ),
        ];
        store_requests_and_responses(&mut pool, &session, &[(request, Timestamp(1))], &responses, &[]).unwrap();
        pool.flush().await.unwrap();

        let fetched = read_responses(backend.as_ref(), &token(), &session, 1).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].response_id, 0);
        assert_eq!(fetched[1].response_id, 1);

        let all = read_requests_and_responses(backend.as_ref(), &token(), &session).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&1].1.len(), 2);
    }

    #[tokio::test]
    async fn check_requests_for_completion_detects_status_attribute() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let session = Subject::new("aff4:/C.1234/flows/F:ABCD");

        let request = FlowRequest {
            request_id: 1,
            payload: b"req".to_vec(),
        };
        let status_response = FlowResponse {
            request_id: 1,
            response_id: 0,
            payload: None,
            is_status: true,
        };
        store_requests_and_responses(&mut pool, &session, &[(request, Timestamp(2))], &[(status_response, Timestamp(2))], &[]).unwrap();
        pool.flush().await.unwrap();

        let completed = check_requests_for_completion(backend.as_ref(), &token(), &session, &[1, 2])
            .await
            .unwrap();
        assert_eq!(completed, vec![1]);
    }

    #[tokio::test]
    async fn read_completed_requests_yields_pair_until_deleted() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let session = Subject::new("aff4:/C.1234/flows/F:ABCD");

        let request = FlowRequest {
            request_id: 1,
            payload: b"req".to_vec(),
        };
        store_requests_and_responses(
            &mut pool,
            &session,
            &[(request, Timestamp(10))],
            &[(
                FlowResponse {
                    request_id: 1,
                    response_id: 0,
                    payload: None,
                    is_status: true,
                },
                Timestamp(10),
            )],
            &[],
        )
        .unwrap();
        pool.flush().await.unwrap();

        let completed = read_completed_requests(backend.as_ref(), &token(), &session).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0.request_id, 1);

        delete_requests(&mut pool, &session, &[1]);
        pool.flush().await.unwrap();

        let completed = read_completed_requests(backend.as_ref(), &token(), &session).await.unwrap();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn delete_requests_removes_request_and_response_subjects() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let session = Subject::new("aff4:/C.1234/flows/F:ABCD");

        let request = FlowRequest {
            request_id: 1,
            payload: b"req".to_vec(),
        };
        store_requests_and_responses(&mut pool, &session, &[(request, Timestamp(1))], &[], &[]).unwrap();
        pool.flush().await.unwrap();

        delete_requests(&mut pool, &session, &[1]);
        pool.flush().await.unwrap();

        let cells = backend
            .resolve(&token(), &state_subject(&session), &[request_attribute(1)], TimestampSpec::All)
            .await
            .unwrap();
        assert!(cells.is_empty());
    }

    #[tokio::test]
    async fn store_requests_and_responses_batches_multiple_requests_and_deletes_atomically() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let session = Subject::new("aff4:/C.1234/flows/F:ABCD");

        let request1 = FlowRequest {
            request_id: 1,
            payload: b"req1".to_vec(),
        };
        let request2 = FlowRequest {
            request_id: 2,
            payload: b"req2".to_vec(),
        };
        store_requests_and_responses(&mut pool, &session, &[(request1, Timestamp(1)), (request2, Timestamp(1))], &[], &[]).unwrap();
        pool.flush().await.unwrap();

        let request3 = FlowRequest {
            request_id: 3,
            payload: b"req3".to_vec(),
        };
        // Delete request 1 and write request 3 to the same `state` subject in
        // the same call: both must land from one `multi_set`.
        store_requests_and_responses(&mut pool, &session, &[(request3, Timestamp(2))], &[], &[1]).unwrap();
        pool.flush().await.unwrap();

        let all = read_requests_and_responses(backend.as_ref(), &token(), &session).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(!all.contains_key(&1));
        assert!(all.contains_key(&2));
        assert!(all.contains_key(&3));
    }

    #[tokio::test]
    async fn multi_destroy_flow_states_enumerates_and_returns_requests() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let session = Subject::new("aff4:/C.1234/flows/F:ABCD");

        let request = FlowRequest {
            request_id: 1,
            payload: b"req".to_vec(),
        };
        store_requests_and_responses(&mut pool, &session, &[(request, Timestamp(1))], &[], &[]).unwrap();
        pool.flush().await.unwrap();

        let mut pool = MutationPool::new(Arc::clone(&backend), token());
        let deleted = multi_destroy_flow_states(backend.as_ref(), &token(), &mut pool, &[session.clone()]).await.unwrap();
        pool.flush().await.unwrap();

        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].0, session);
        assert_eq!(deleted[0].1.request_id, 1);

        let all = read_requests_and_responses(backend.as_ref(), &token(), &session).await.unwrap();
        assert!(all.is_empty());
    }
}
