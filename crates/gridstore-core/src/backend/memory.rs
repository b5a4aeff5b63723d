//! An in-memory reference [`Backend`] implementation.
//!
//! Used by the pattern operators' own tests and by any embedder that does
//! not need durability (local tooling, unit tests of a larger system).
//! Rows are sharded by subject in a [`DashMap`], matching the teacher
//! crate's preference for `DashMap` over a single `Mutex`-guarded
//! `HashMap` on high-contention maps.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use super::{scan_directory_prefix, validate_after_urn, Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::StoreResult;
use crate::model::{Attribute, Cell, Subject, Timestamp, TimestampSpec, Value, NEWEST_TIMESTAMP};

type Versions = BTreeMap<i64, Value>;
type Row = BTreeMap<Attribute, Versions>;

/// An in-memory, process-local backend. Holds everything in a sharded map;
/// nothing is persisted across restarts.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    rows: DashMap<Subject, Row>,
}

impl MemoryBackend {
    /// Builds an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cells_for_attribute(
        subject: &Subject,
        attribute: &Attribute,
        versions: &Versions,
        spec: TimestampSpec,
    ) -> Vec<Cell> {
        let newest = versions.keys().next_back().copied();
        let mut matched: Vec<Cell> = versions
            .iter()
            .filter(|(ts, _)| spec.matches(Timestamp(**ts), newest.map(Timestamp)))
            .map(|(ts, value)| Cell {
                subject: subject.clone(),
                attribute: attribute.clone(),
                timestamp: Timestamp(*ts),
                value: value.clone(),
            })
            .collect();
        matched.reverse();
        matched
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn delete_subject(&self, _token: &AuthToken, subject: &Subject) -> StoreResult<()> {
        self.rows.remove(subject);
        Ok(())
    }

    async fn multi_set(
        &self,
        _token: &AuthToken,
        subject: &Subject,
        entries: &[SetEntry],
        replace: bool,
        to_delete: &[Attribute],
    ) -> StoreResult<()> {
        let mut row = self.rows.entry(subject.clone()).or_default();

        for attribute in to_delete {
            row.remove(attribute);
        }

        if replace {
            let touched: HashSet<&Attribute> = entries.iter().map(|e| &e.attribute).collect();
            for attribute in touched {
                row.remove(attribute);
            }
        }

        for entry in entries {
            let ts = if entry.timestamp.0 == NEWEST_TIMESTAMP {
                Timestamp::now().0
            } else {
                entry.timestamp.0
            };
            row.entry(entry.attribute.clone())
                .or_default()
                .insert(ts, entry.value.clone());
        }
        Ok(())
    }

    async fn delete_attributes(
        &self,
        _token: &AuthToken,
        subject: &Subject,
        attributes: &[(Attribute, TimestampSpec)],
    ) -> StoreResult<()> {
        let Some(mut row) = self.rows.get_mut(subject) else {
            return Ok(());
        };
        for (attribute, spec) in attributes {
            if let Some(versions) = row.get_mut(attribute) {
                match spec {
                    TimestampSpec::All => {
                        versions.clear();
                    }
                    TimestampSpec::Newest => {
                        if let Some((&ts, _)) = versions.iter().next_back() {
                            versions.remove(&ts);
                        }
                    }
                    TimestampSpec::Range(start, end) => {
                        versions.retain(|ts, _| *ts < *start || *ts > *end);
                    }
                }
                if versions.is_empty() {
                    row.remove(attribute);
                }
            }
        }
        Ok(())
    }

    async fn resolve(
        &self,
        _token: &AuthToken,
        subject: &Subject,
        attributes: &[Attribute],
        spec: TimestampSpec,
    ) -> StoreResult<Vec<Cell>> {
        let Some(row) = self.rows.get(subject) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for attribute in attributes {
            if let Some(versions) = row.get(attribute) {
                out.extend(Self::cells_for_attribute(subject, attribute, versions, spec));
            }
        }
        Ok(out)
    }

    async fn resolve_prefix(
        &self,
        _token: &AuthToken,
        subject: &Subject,
        prefix: &str,
        spec: TimestampSpec,
    ) -> StoreResult<Vec<Cell>> {
        let Some(row) = self.rows.get(subject) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (attribute, versions) in row.iter() {
            if attribute.has_prefix(prefix) {
                out.extend(Self::cells_for_attribute(subject, attribute, versions, spec));
            }
        }
        out.sort_by(|a, b| a.attribute.cmp(&b.attribute));
        Ok(out)
    }

    async fn multi_resolve_prefix(
        &self,
        token: &AuthToken,
        subjects: &[Subject],
        prefix: &str,
        spec: TimestampSpec,
    ) -> StoreResult<Vec<(Subject, Vec<Cell>)>> {
        let mut out = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let cells = self.resolve_prefix(token, subject, prefix, spec).await?;
            if !cells.is_empty() {
                out.push((subject.clone(), cells));
            }
        }
        Ok(out)
    }

    fn scan_attributes<'a>(
        &'a self,
        _token: &'a AuthToken,
        subject_prefix: &'a Subject,
        attributes: &'a [Attribute],
        after_urn: Option<&'a Subject>,
        max_records: Option<usize>,
        relaxed_order: bool,
    ) -> BoxStream<'a, StoreResult<(Subject, Vec<Cell>)>> {
        if let Err(err) = validate_after_urn(subject_prefix, after_urn) {
            return stream::once(async move { Err(err) }).boxed();
        }

        let directory = scan_directory_prefix(subject_prefix);
        let mut matches = Vec::new();
        for entry in &self.rows {
            let subject = entry.key();
            if !subject.as_str().starts_with(&directory) {
                continue;
            }
            if let Some(after) = after_urn {
                if subject <= after {
                    continue;
                }
            }
            let row = entry.value();
            let mut cells = Vec::new();
            for attribute in attributes {
                if let Some(versions) = row.get(attribute) {
                    cells.extend(Self::cells_for_attribute(
                        subject,
                        attribute,
                        versions,
                        TimestampSpec::Newest,
                    ));
                }
            }
            if !cells.is_empty() {
                matches.push((subject.clone(), cells));
            }
        }

        if !relaxed_order {
            matches.sort_by(|(s1, _), (s2, _)| s1.cmp(s2));
        }
        if let Some(max) = max_records {
            matches.truncate(max);
        }
        stream::iter(matches.into_iter().map(Ok)).boxed()
    }

    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn size(&self) -> StoreResult<i64> {
        let mut bytes: i64 = 0;
        for entry in &self.rows {
            for versions in entry.value().values() {
                for value in versions.values() {
                    bytes = bytes.saturating_add(match value {
                        Value::Integer(_) => 8,
                        Value::Text(s) => i64::try_from(s.len()).unwrap_or(i64::MAX),
                        Value::Bytes(b) => i64::try_from(b.len()).unwrap_or(i64::MAX),
                    });
                }
            }
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> AuthToken {
        AuthToken::anonymous()
    }

    #[tokio::test]
    async fn set_then_resolve_round_trips() {
        let backend = MemoryBackend::new();
        let subject = Subject::new("aff4:/C.1234");
        let attribute = Attribute::new("metadata:hostname");
        backend
            .multi_set(
                &token(),
                &subject,
                &[SetEntry {
                    attribute: attribute.clone(),
                    timestamp: Timestamp(100),
                    value: Value::text("host-a"),
                }],
                true,
                &[],
            )
            .await
            .unwrap();

        let cells = backend
            .resolve(&token(), &subject, &[attribute], TimestampSpec::Newest)
            .await
            .unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value.as_text(), Some("host-a"));
    }

    #[tokio::test]
    async fn newest_timestamp_picks_latest_version() {
        let backend = MemoryBackend::new();
        let subject = Subject::new("aff4:/C.1234");
        let attribute = Attribute::new("metadata:hostname");
        backend
            .multi_set(
                &token(),
                &subject,
                &[
                    SetEntry {
                        attribute: attribute.clone(),
                        timestamp: Timestamp(100),
                        value: Value::text("host-a"),
                    },
                    SetEntry {
                        attribute: attribute.clone(),
                        timestamp: Timestamp(200),
                        value: Value::text("host-b"),
                    },
                ],
                false,
                &[],
            )
            .await
            .unwrap();

        let cells = backend
            .resolve(
                &token(),
                &subject,
                &[attribute.clone()],
                TimestampSpec::Newest,
            )
            .await
            .unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value.as_text(), Some("host-b"));

        let all = backend
            .resolve(&token(), &subject, &[attribute], TimestampSpec::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value.as_text(), Some("host-b"), "newest first");
    }

    #[tokio::test]
    async fn replace_true_drops_prior_versions() {
        let backend = MemoryBackend::new();
        let subject = Subject::new("aff4:/C.1234");
        let attribute = Attribute::new("task:00000001");
        backend
            .multi_set(
                &token(),
                &subject,
                &[SetEntry {
                    attribute: attribute.clone(),
                    timestamp: Timestamp(100),
                    value: Value::bytes(vec![1]),
                }],
                true,
                &[],
            )
            .await
            .unwrap();
        backend
            .multi_set(
                &token(),
                &subject,
                &[SetEntry {
                    attribute: attribute.clone(),
                    timestamp: Timestamp(200),
                    value: Value::bytes(vec![2]),
                }],
                true,
                &[],
            )
            .await
            .unwrap();

        let all = backend
            .resolve(&token(), &subject, &[attribute], TimestampSpec::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 1, "replace=true keeps only the newest write");
        assert_eq!(all[0].timestamp, Timestamp(200));
    }

    #[tokio::test]
    async fn delete_subject_removes_all_cells() {
        let backend = MemoryBackend::new();
        let subject = Subject::new("aff4:/C.1234");
        backend
            .multi_set(
                &token(),
                &subject,
                &[SetEntry {
                    attribute: Attribute::new("a"),
                    timestamp: Timestamp(1),
                    value: Value::Integer(1),
                }],
                true,
                &[],
            )
            .await
            .unwrap();
        backend.delete_subject(&token(), &subject).await.unwrap();
        let cells = backend
            .resolve(
                &token(),
                &subject,
                &[Attribute::new("a")],
                TimestampSpec::All,
            )
            .await
            .unwrap();
        assert!(cells.is_empty());
    }

    #[tokio::test]
    async fn resolve_prefix_only_matches_namespace() {
        let backend = MemoryBackend::new();
        let subject = Subject::new("aff4:/C.1234");
        backend
            .multi_set(
                &token(),
                &subject,
                &[
                    SetEntry {
                        attribute: Attribute::new("task:00000001"),
                        timestamp: Timestamp(1),
                        value: Value::bytes(vec![1]),
                    },
                    SetEntry {
                        attribute: Attribute::new("notify:session"),
                        timestamp: Timestamp(2),
                        value: Value::bytes(vec![2]),
                    },
                ],
                true,
                &[],
            )
            .await
            .unwrap();

        let cells = backend
            .resolve_prefix(&token(), &subject, "task:", TimestampSpec::Newest)
            .await
            .unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].attribute.as_str(), "task:00000001");
    }

    #[tokio::test]
    async fn scan_attributes_respects_after_urn_and_directory_boundary() {
        let backend = MemoryBackend::new();
        let root = Subject::new("aff4:/C.1234/Results");
        let attribute = Attribute::new("aff4:sequential_value");
        for (name, ts) in [("0000000000000001.000001", 1i64), ("0000000000000002.000001", 2)] {
            backend
                .multi_set(
                    &token(),
                    &root.child(name),
                    &[SetEntry {
                        attribute: attribute.clone(),
                        timestamp: Timestamp(ts),
                        value: Value::bytes(vec![1]),
                    }],
                    true,
                    &[],
                )
                .await
                .unwrap();
        }
        // A sibling subject outside the scanned directory must never appear.
        backend
            .multi_set(
                &token(),
                &Subject::new("aff4:/C.12345/Results/x"),
                &[SetEntry {
                    attribute: attribute.clone(),
                    timestamp: Timestamp(1),
                    value: Value::bytes(vec![9]),
                }],
                true,
                &[],
            )
            .await
            .unwrap();

        let after = root.child("0000000000000001.000001");
        let mut stream = backend.scan_attributes(
            &token(),
            &root,
            std::slice::from_ref(&attribute),
            Some(&after),
            None,
            false,
        );
        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap().0);
        }
        assert_eq!(seen, vec![root.child("0000000000000002.000001")]);
    }

    #[tokio::test]
    async fn scan_attributes_rejects_after_urn_outside_prefix() {
        let backend = MemoryBackend::new();
        let root = Subject::new("aff4:/C.1234/Results");
        let after = Subject::new("aff4:/other/x");
        let mut stream = backend.scan_attributes(&token(), &root, &[], Some(&after), None, false);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, crate::error::StoreError::InvalidArgument(_)));
    }
}
