//! Error types returned by the store and its pattern operators.

use thiserror::Error;

/// The result type returned by every fallible store operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the backend trait, the subject-lock protocol and the
/// pattern operators built on top of them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A subject lock could not be acquired before the retry budget ran out.
    #[error("lock contended on subject {subject}")]
    LockContended {
        /// The subject the caller tried to lock.
        subject: String,
    },

    /// The caller's token was rejected by the configured [`crate::config::AuthMode`].
    #[error("unauthorized")]
    Unauthorized,

    /// The backend could not be reached or returned a transient failure.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A caller supplied a value outside an operation's documented domain
    /// (for example, ranged-delete on a stats subject with
    /// [`crate::model::TimestampSpec::Newest`]).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Returns `true` for errors a caller may reasonably retry after a
    /// backoff, as opposed to errors that are a caller bug.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContended { .. } | Self::BackendUnavailable(_) | Self::Timeout
        )
    }
}
