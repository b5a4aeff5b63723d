//! The abstract backend contract: row/attribute/timestamp primitives every
//! concrete storage implementation must provide.
//!
//! Every method is a thin, low-level primitive. Locking, batching, and the
//! pattern operators (queues, collections, flows, ...) are built on top of
//! this trait in other modules and never need to know which concrete
//! backend is underneath.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::AuthToken;
use crate::error::{StoreError, StoreResult};
use crate::model::{Attribute, Cell, Subject, TimestampSpec, Value};

/// One `(attribute, timestamp, value)` write destined for a single subject,
/// as taken by [`Backend::multi_set`].
#[derive(Debug, Clone)]
pub struct SetEntry {
    /// The attribute to write.
    pub attribute: Attribute,
    /// The version to write at.
    pub timestamp: crate::model::Timestamp,
    /// The payload to write.
    pub value: Value,
}

/// The abstract row/attribute/timestamp backend contract.
///
/// Implementations are free to choose any physical representation as long
/// as they honor the data-model invariants: a `(subject, attribute,
/// timestamp)` triple holds at most one value, writes at an existing
/// timestamp replace rather than duplicate, and ranged/`All` reads return
/// newest-first.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deletes every cell belonging to `subject`. Idempotent: deleting an
    /// absent subject is not an error.
    async fn delete_subject(&self, token: &AuthToken, subject: &Subject) -> StoreResult<()>;

    /// Deletes every cell belonging to each subject in `subjects`.
    async fn delete_subjects(&self, token: &AuthToken, subjects: &[Subject]) -> StoreResult<()> {
        for subject in subjects {
            self.delete_subject(token, subject).await?;
        }
        Ok(())
    }

    /// Writes `entries` to `subject`, one backend round trip per call.
    ///
    /// `to_delete` attributes are cleared entirely before any entry is
    /// written. When `replace` is `true`, every attribute named in
    /// `entries` also has its prior versions cleared before the new
    /// version lands, so only the newest-written cell for that attribute
    /// survives; when `false`, new versions are added alongside whatever
    /// is already there.
    async fn multi_set(
        &self,
        token: &AuthToken,
        subject: &Subject,
        entries: &[SetEntry],
        replace: bool,
        to_delete: &[Attribute],
    ) -> StoreResult<()>;

    /// Deletes specific `(attribute, TimestampSpec)` pairs from `subject`.
    async fn delete_attributes(
        &self,
        token: &AuthToken,
        subject: &Subject,
        attributes: &[(Attribute, TimestampSpec)],
    ) -> StoreResult<()>;

    /// Reads the cells of `subject` restricted to `attributes`, honoring
    /// `spec`. Returned newest-first within each attribute.
    async fn resolve(
        &self,
        token: &AuthToken,
        subject: &Subject,
        attributes: &[Attribute],
        spec: TimestampSpec,
    ) -> StoreResult<Vec<Cell>>;

    /// `resolve` fanned out across `subjects`, one entry per subject that
    /// had at least one matching cell. Order across subjects is
    /// unspecified.
    async fn resolve_multi(
        &self,
        token: &AuthToken,
        subjects: &[Subject],
        attributes: &[Attribute],
        spec: TimestampSpec,
    ) -> StoreResult<Vec<(Subject, Vec<Cell>)>> {
        let mut out = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let cells = self.resolve(token, subject, attributes, spec).await?;
            if !cells.is_empty() {
                out.push((subject.clone(), cells));
            }
        }
        Ok(out)
    }

    /// Reads every cell of `subject` whose attribute starts with `prefix`,
    /// sorted by attribute name.
    async fn resolve_prefix(
        &self,
        token: &AuthToken,
        subject: &Subject,
        prefix: &str,
        spec: TimestampSpec,
    ) -> StoreResult<Vec<Cell>>;

    /// `resolve_prefix` fanned out across `subjects`.
    async fn multi_resolve_prefix(
        &self,
        token: &AuthToken,
        subjects: &[Subject],
        prefix: &str,
        spec: TimestampSpec,
    ) -> StoreResult<Vec<(Subject, Vec<Cell>)>>;

    /// Lazily scans every subject strictly under `subject_prefix`, reading
    /// only the newest cell of each attribute in `attributes`.
    ///
    /// `after_urn`, when given, must itself fall under `subject_prefix`;
    /// only subjects that sort strictly after it are yielded. `max_records`
    /// caps how many subjects are yielded. Scan order is lexicographic by
    /// subject unless `relaxed_order` is set, in which case a backend may
    /// pick whatever order is cheapest for it.
    ///
    /// # Errors
    ///
    /// The returned stream yields a single [`StoreError::InvalidArgument`]
    /// if `after_urn` does not fall under `subject_prefix`.
    fn scan_attributes<'a>(
        &'a self,
        token: &'a AuthToken,
        subject_prefix: &'a Subject,
        attributes: &'a [Attribute],
        after_urn: Option<&'a Subject>,
        max_records: Option<usize>,
        relaxed_order: bool,
    ) -> BoxStream<'a, StoreResult<(Subject, Vec<Cell>)>>;

    /// Forces any buffered writes to become durable/visible.
    async fn flush(&self) -> StoreResult<()>;

    /// Approximate backend size in bytes, or a negative value if unknown.
    async fn size(&self) -> StoreResult<i64>;
}

/// The directory prefix a subject must start with to be yielded by
/// [`Backend::scan_attributes`] rooted at `subject_prefix`.
#[must_use]
pub fn scan_directory_prefix(subject_prefix: &Subject) -> String {
    let raw = subject_prefix.as_str();
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

/// Validates that `after_urn` (if present) falls under `subject_prefix`,
/// as [`Backend::scan_attributes`] implementations must before scanning.
///
/// # Errors
///
/// Returns [`StoreError::InvalidArgument`] if `after_urn` does not start
/// with `subject_prefix` followed by `/`.
pub fn validate_after_urn(subject_prefix: &Subject, after_urn: Option<&Subject>) -> StoreResult<()> {
    let Some(after_urn) = after_urn else {
        return Ok(());
    };
    let directory = scan_directory_prefix(subject_prefix);
    if after_urn.as_str().starts_with(&directory) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "after_urn \"{after_urn}\" does not begin with prefix \"{directory}\""
        )))
    }
}
