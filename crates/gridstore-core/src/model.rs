//! Core data model: subjects, attributes, timestamps, values and cells.
//!
//! A [`Subject`] names a row in the store. An [`Attribute`] names a column
//! within that row. A [`Cell`] is the triple `(subject, attribute,
//! timestamp)` mapped to exactly one [`Value`]. Multiple cells at the same
//! `(subject, attribute)` but different timestamps form a version history;
//! `replace` semantics mean writing at an existing timestamp overwrites that
//! version rather than adding a new one.

use std::fmt;
use std::sync::Arc;

/// Sentinel timestamp meaning "the most recently written version".
pub const NEWEST_TIMESTAMP: i64 = i64::MAX;

/// A row key in the store: a `/`-separated hierarchical path.
///
/// Subjects support a suffixing operation (used heavily by sequential
/// collections and queues to derive per-item subjects from a base URN)
/// rather than arbitrary string concatenation, so that callers cannot
/// accidentally straddle a path boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Subject(String);

impl Subject {
    /// Builds a subject from an arbitrary path string.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Appends a path segment, returning the child subject.
    #[must_use]
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        let segment = segment.as_ref();
        if self.0.ends_with('/') {
            Self(format!("{}{segment}", self.0))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    /// Returns the subject's path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if `self` is `other` or a descendant of `other`.
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        self.0 == other.0 || self.0.starts_with(&format!("{}/", other.0))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Subject {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Subject {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A column name. Namespace prefixes (`task:`, `notify:`, `kw_index:`, ...)
/// are plain string prefixes; any backend is free to index them however it
/// likes as long as prefix reads (`resolve_prefix`) respect `starts_with`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Attribute(String);

impl Attribute {
    /// Builds an attribute from an arbitrary name string.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the attribute's name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this attribute's name starts with `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Attribute {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Builds a timestamp from a microsecond count.
    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// The current wall-clock time, in microseconds.
    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_micros())
    }

    /// Returns the timestamp shifted forward by `micros`.
    ///
    /// Used by the task queue's lease-by-future-timestamp trick: a claimed
    /// task is rewritten at `now + lease_micros` so unclaimed scans (which
    /// only look at the current time) skip it until the lease expires.
    #[must_use]
    pub fn plus_micros(self, micros: i64) -> Self {
        Self(self.0.saturating_add(micros))
    }
}

/// Selects which version(s) of a cell a read should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSpec {
    /// Only the most recently written version.
    Newest,
    /// Every version, newest first.
    All,
    /// Every version whose timestamp falls in `[start, end]`, newest first.
    Range(i64, i64),
}

impl TimestampSpec {
    /// Returns `true` if `ts` is selected by this spec.
    #[must_use]
    pub fn matches(&self, ts: Timestamp, newest: Option<Timestamp>) -> bool {
        match self {
            Self::Newest => Some(ts) == newest,
            Self::All => true,
            Self::Range(start, end) => ts.0 >= *start && ts.0 <= *end,
        }
    }
}

/// A stored value: a signed integer, a Unicode string, or an opaque byte
/// string. `Text` and `Bytes` wrap their payload in `Arc` so cloning a
/// `Value` — which the pool and backend do frequently while batching
/// writes — never copies the underlying bytes.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A Unicode string.
    Text(Arc<String>),
    /// An opaque byte string.
    Bytes(Arc<Vec<u8>>),
}

impl Clone for Value {
    fn clone(&self) -> Self {
        match self {
            Self::Integer(i) => Self::Integer(*i),
            Self::Text(s) => Self::Text(Arc::clone(s)),
            Self::Bytes(b) => Self::Bytes(Arc::clone(b)),
        }
    }
}

impl Value {
    /// Builds a text value.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(Arc::new(value.into()))
    }

    /// Builds a bytes value.
    #[must_use]
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Arc::new(value.into()))
    }

    /// Returns the inner string if this is a [`Value::Text`].
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the inner byte slice if this is a [`Value::Bytes`].
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Returns the inner integer if this is a [`Value::Integer`].
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// One versioned `(subject, attribute, timestamp) -> value` triple.
#[derive(Debug, Clone)]
pub struct Cell {
    /// The row this cell belongs to.
    pub subject: Subject,
    /// The column this cell belongs to.
    pub attribute: Attribute,
    /// The version this cell represents.
    pub timestamp: Timestamp,
    /// The stored payload.
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_child_appends_one_segment() {
        let base = Subject::new("aff4:/C.1234/flows");
        let child = base.child("F:ABCD1234");
        assert_eq!(child.as_str(), "aff4:/C.1234/flows/F:ABCD1234");
    }

    #[test]
    fn subject_starts_with_respects_path_boundary() {
        let base = Subject::new("aff4:/C.1234");
        let sibling = Subject::new("aff4:/C.12345");
        assert!(!sibling.starts_with(&base));
        let child = base.child("flows");
        assert!(child.starts_with(&base));
        assert!(base.starts_with(&base));
    }

    #[test]
    fn value_clone_is_cheap_for_heap_variants() {
        let v = Value::text("hello");
        let clone = v.clone();
        if let (Value::Text(a), Value::Text(b)) = (&v, &clone) {
            assert!(Arc::ptr_eq(a, b));
        } else {
            unreachable!("value must remain Text variant");
        }
    }

    #[test]
    fn timestamp_spec_range_is_inclusive() {
        let spec = TimestampSpec::Range(10, 20);
        assert!(spec.matches(Timestamp(10), None));
        assert!(spec.matches(Timestamp(20), None));
        assert!(!spec.matches(Timestamp(21), None));
    }

    proptest::proptest! {
        /// A child subject always reports as a descendant of its parent,
        /// and no unrelated sibling whose path merely shares the parent as
        /// a string prefix is mistaken for one.
        #[test]
        fn child_always_starts_with_parent(parent in "[a-z:/]{1,20}", segment in "[a-zA-Z0-9_.-]{1,20}") {
            let base = Subject::new(parent);
            let child = base.child(&segment);
            proptest::prop_assert!(child.starts_with(&base));
        }

        /// `starts_with` never matches across a path boundary: appending a
        /// same-length but different suffix directly onto the raw string
        /// (rather than through `child`) must not be treated as a
        /// descendant unless a `/` actually separates them.
        #[test]
        fn starts_with_requires_a_path_separator(parent in "[a-z]{1,10}", suffix in "[a-z]{1,10}") {
            let base = Subject::new(parent.clone());
            let glued = Subject::new(format!("{parent}{suffix}"));
            proptest::prop_assert!(!glued.starts_with(&base) || suffix.is_empty());
        }

        /// `Range` matching is exactly the inclusive interval, regardless
        /// of which of `start`/`end` is numerically larger in the input.
        #[test]
        fn range_matches_iff_within_bounds(a in i64::MIN..i64::MAX, b in i64::MIN..i64::MAX, ts in i64::MIN..i64::MAX) {
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            let spec = TimestampSpec::Range(start, end);
            proptest::prop_assert_eq!(spec.matches(Timestamp(ts), None), ts >= start && ts <= end);
        }

        /// `plus_micros` never panics or wraps around on overflow; it
        /// saturates instead, matching the task queue's lease-rewrite use
        /// where an attacker-influenced TTL must not wrap a lease into the
        /// past.
        #[test]
        fn plus_micros_saturates_instead_of_overflowing(base in i64::MIN..i64::MAX, delta in i64::MIN..i64::MAX) {
            let result = Timestamp(base).plus_micros(delta);
            proptest::prop_assert_eq!(result.0, base.saturating_add(delta));
        }
    }
}
