//! Claim-based record queues.
//!
//! Unlike [`crate::queue`], which leases a whole task by rewriting its
//! cell's timestamp, a record queue leases individual records by writing
//! an `aff4:lease` expiry directly on each record's own subject — the
//! same attribute and mechanism [`crate::lock::SubjectLock`] uses on a
//! queue's shard subject, just applied per record instead. Records live
//! under `<base>/Records/<16-hex-ts>.<6-hex-suffix>`, built with
//! [`crate::collections::make_urn`].

use futures::StreamExt;
use tracing::instrument;

use crate::backend::{Backend, SetEntry};
use crate::collections::{self, CollectionItem};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::lock::LOCK_ATTRIBUTE;
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

/// The subpath records are stored under, mirroring [`crate::collections::DEFAULT_SUBPATH`]
/// but distinct so a base can host both a user collection and a record
/// queue without collision.
pub const SUBPATH: &str = "Records";

const RECORD_VALUE_ATTRIBUTE: &str = "aff4:sequential_value";

fn lease_attribute() -> Attribute {
    Attribute::new(LOCK_ATTRIBUTE)
}

/// A record read back from a queue, together with its claim state.
#[derive(Debug, Clone)]
pub struct Record {
    /// The record's own subject.
    pub subject: Subject,
    /// The record's opaque payload.
    pub value: Vec<u8>,
    /// The record's scheduled timestamp.
    pub timestamp: Timestamp,
    /// The record's claim expiry, if currently leased.
    pub lease_expiry: Option<Timestamp>,
}

/// Enqueues a new record under `base`'s `Records` subpath.
pub fn add_item(pool: &mut MutationPool, base: &Subject, item: &[u8], timestamp: Timestamp) -> Subject {
    let (subject, timestamp, _suffix) = collections::make_urn(base, timestamp, None, SUBPATH);
    pool.multi_set(
        subject.clone(),
        vec![SetEntry {
            attribute: Attribute::new(RECORD_VALUE_ATTRIBUTE),
            timestamp,
            value: Value::bytes(item.to_vec()),
        }],
        true,
        Vec::new(),
    );
    subject
}

/// Parameters for [`claim`].
pub struct ClaimOptions<'a> {
    /// How long the claim lasts before the record becomes reclaimable.
    pub lease: std::time::Duration,
    /// Stop once this many records have been claimed.
    pub limit: usize,
    /// Only consider records scanned strictly after this point; `None`
    /// scans from the start of the queue.
    pub start_time: Option<Timestamp>,
    /// Called on every unleased record's raw payload before it is
    /// claimed; a `true` result skips the record without leasing it.
    /// `None` accepts every record.
    pub record_filter: Option<&'a (dyn Fn(&[u8]) -> bool + Send + Sync)>,
    /// Stop scanning once this many *consecutive* records have been
    /// filtered out, rather than scanning the whole queue looking for a
    /// match past a long unfiltered run.
    pub max_filtered: usize,
}

impl Default for ClaimOptions<'_> {
    fn default() -> Self {
        Self {
            lease: std::time::Duration::from_secs(30 * 60),
            limit: 10_000,
            start_time: None,
            record_filter: None,
            max_filtered: 1_000,
        }
    }
}

/// Claims up to `options.limit` unleased records under `base`, leasing
/// each for `options.lease` by writing an expiry on the record's own
/// subject.
///
/// A record already under an unexpired lease is skipped; this is a
/// best-effort scan rather than a single atomic claim, so under
/// concurrent claimants two callers can both observe a record as
/// unleased and both attempt to lease it — the second write simply wins,
/// matching the advisory nature of [`crate::lock::SubjectLock`]. The scan
/// is capped at `4 * options.limit` rows so a queue dominated by filtered
/// records cannot make a single claim scan unboundedly far.
///
/// # Errors
///
/// Propagates backend errors.
#[instrument(skip(backend, token, options))]
pub async fn claim(backend: &dyn Backend, token: &AuthToken, base: &Subject, options: ClaimOptions<'_>) -> StoreResult<Vec<Record>> {
    let root = base.child(SUBPATH);
    let value_attr = Attribute::new(RECORD_VALUE_ATTRIBUTE);
    let lease_attr = lease_attribute();
    let attrs = [value_attr.clone(), lease_attr.clone()];

    let after_urn = options
        .start_time
        .map(|start| collections::make_urn(base, start, Some(0), SUBPATH).0);
    let max_records = options.limit.saturating_mul(4);
    let mut stream = backend.scan_attributes(token, &root, &attrs, after_urn.as_ref(), Some(max_records), false);

    let now = Timestamp::now();
    let lease_micros = i64::try_from(options.lease.as_micros()).unwrap_or(i64::MAX);
    let expiry = now.plus_micros(lease_micros);

    let mut claimed = Vec::new();
    let mut dangling = Vec::new();
    let mut filtered_count = 0usize;
    while let Some(row) = stream.next().await {
        if claimed.len() >= options.limit {
            break;
        }
        let (subject, cells) = row?;
        let leased_until = cells
            .iter()
            .find(|c| c.attribute == lease_attr)
            .and_then(|c| c.value.as_integer());
        if let Some(until) = leased_until {
            if until > now.0 {
                continue;
            }
        }
        let Some(value_cell) = cells.iter().find(|c| c.attribute == value_attr) else {
            // sequential_value missing: a dangling lease left behind by a
            // record that was claimed and then deleted out from under it.
            // Schedule its lease attribute for deletion and move on.
            if leased_until.is_some() {
                dangling.push(subject);
            }
            continue;
        };

        let payload = value_cell.value.as_bytes().unwrap_or_default();
        if let Some(filter) = options.record_filter {
            if filter(payload) {
                filtered_count = filtered_count.saturating_add(1);
                if options.max_filtered > 0 && filtered_count >= options.max_filtered {
                    break;
                }
                continue;
            }
        }
        filtered_count = 0;

        backend
            .multi_set(
                token,
                &subject,
                &[SetEntry {
                    attribute: lease_attr.clone(),
                    timestamp: now,
                    value: Value::Integer(expiry.0),
                }],
                true,
                &[],
            )
            .await?;

        claimed.push(Record {
            subject,
            value: payload.to_vec(),
            timestamp: value_cell.timestamp,
            lease_expiry: Some(expiry),
        });
    }

    for subject in dangling {
        backend
            .delete_attributes(token, &subject, &[(lease_attr.clone(), TimestampSpec::All)])
            .await?;
    }

    Ok(claimed)
}

/// Extends the lease on each of `subjects` by `lease`, keeping a claim
/// alive across a long-running handler.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn refresh_claims(
    backend: &dyn Backend,
    token: &AuthToken,
    subjects: &[Subject],
    lease: std::time::Duration,
) -> StoreResult<()> {
    let lease_micros = i64::try_from(lease.as_micros()).unwrap_or(i64::MAX);
    let expiry = Timestamp::now().plus_micros(lease_micros);
    for subject in subjects {
        backend
            .multi_set(
                token,
                subject,
                &[SetEntry {
                    attribute: lease_attribute(),
                    timestamp: Timestamp::now(),
                    value: Value::Integer(expiry.0),
                }],
                true,
                &[],
            )
            .await?;
    }
    Ok(())
}

/// Releases the claim on each of `subjects` without deleting the record,
/// making it immediately eligible for [`claim`] again.
pub fn release_records(pool: &mut MutationPool, subjects: impl IntoIterator<Item = Subject>) {
    for subject in subjects {
        pool.delete_attributes(subject, vec![(lease_attribute(), TimestampSpec::All)]);
    }
}

/// Enqueues removal of each of `subjects` entirely, completing them.
pub fn delete_records(pool: &mut MutationPool, subjects: impl IntoIterator<Item = Subject>) {
    pool.delete_subjects(subjects);
}

/// Reads every record under `base`, leased or not, for diagnostics and
/// tests; production claimants should use [`claim`] instead.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn scan_all(backend: &dyn Backend, token: &AuthToken, base: &Subject) -> StoreResult<Vec<CollectionItem>> {
    collections::scan_items(backend, token, base, None, None, None).await
}
