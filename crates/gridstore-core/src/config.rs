//! Configuration surface for the store.
//!
//! Loading these values from a file or environment is an external
//! collaborator's job; this module only models the selection keys the
//! store itself needs.

/// Which concrete [`crate::backend::Backend`] implementation to construct.
///
/// Only [`Self::Memory`] is implemented in this crate. A production
/// deployment adds further variants without touching the `Backend` trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatastoreImplementation {
    /// The in-memory reference backend.
    #[default]
    Memory,
}

/// Which registered [`crate::blob::BlobStore`] implementation backs blob
/// passthrough. The store never constructs one itself — this is a
/// selection key for the embedding application's collaborator wiring.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BlobstoreImplementation {
    /// No blob collaborator configured; blob operations are unavailable.
    #[default]
    None,
    /// A named, externally-registered blob backend.
    Named(String),
}

/// How the store treats an absent caller token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Every call must carry a non-empty token.
    RequireToken,
    /// An absent token is replaced by a configured default before checks
    /// run, preserving the original's implicit global default-token
    /// behavior for deployments that want it.
    #[default]
    AllowDefault,
    /// Tokens are not checked at all.
    Anonymous,
}

/// An opaque caller credential. The store never interprets its contents;
/// validating a token against an ACL is an external collaborator's job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthToken(Option<String>);

impl AuthToken {
    /// Wraps a caller-supplied token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// The absent token.
    #[must_use]
    pub fn anonymous() -> Self {
        Self(None)
    }

    /// Returns the token string, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Top-level store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Which backend implementation to construct.
    pub datastore_implementation: DatastoreImplementation,
    /// Which blob-store implementation the embedding application has wired
    /// up, if any.
    pub blobstore_implementation: BlobstoreImplementation,
    /// How an absent caller token is treated.
    pub auth_mode: AuthMode,
    /// Default token substituted when `auth_mode` is
    /// [`AuthMode::AllowDefault`] and the caller supplied none.
    pub default_token: Option<String>,
    /// Interval between background mutation-pool flush sweeps.
    pub flush_interval: std::time::Duration,
    /// Interval between background backend-size polls.
    pub size_monitor_interval: std::time::Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            datastore_implementation: DatastoreImplementation::default(),
            blobstore_implementation: BlobstoreImplementation::default(),
            auth_mode: AuthMode::default(),
            default_token: None,
            flush_interval: std::time::Duration::from_millis(500),
            size_monitor_interval: std::time::Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    /// Resolves a caller-supplied token against [`Self::auth_mode`],
    /// returning [`crate::error::StoreError::Unauthorized`] when the mode
    /// rejects it.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` when `auth_mode` is
    /// [`AuthMode::RequireToken`] and `token` is absent.
    pub fn resolve_token(&self, token: AuthToken) -> crate::error::StoreResult<AuthToken> {
        match self.auth_mode {
            AuthMode::Anonymous => Ok(token),
            AuthMode::RequireToken => {
                if token.as_str().is_some() {
                    Ok(token)
                } else {
                    Err(crate::error::StoreError::Unauthorized)
                }
            }
            AuthMode::AllowDefault => {
                if token.as_str().is_some() {
                    Ok(token)
                } else {
                    Ok(self
                        .default_token
                        .clone()
                        .map_or_else(AuthToken::anonymous, AuthToken::new))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_token_rejects_anonymous() {
        let config = StoreConfig {
            auth_mode: AuthMode::RequireToken,
            ..StoreConfig::default()
        };
        assert!(config.resolve_token(AuthToken::anonymous()).is_err());
    }

    #[test]
    fn allow_default_substitutes_configured_token() {
        let config = StoreConfig {
            auth_mode: AuthMode::AllowDefault,
            default_token: Some("default-token".to_string()),
            ..StoreConfig::default()
        };
        let resolved = config.resolve_token(AuthToken::anonymous()).unwrap();
        assert_eq!(resolved.as_str(), Some("default-token"));
    }

    #[test]
    fn anonymous_mode_accepts_missing_token() {
        let config = StoreConfig {
            auth_mode: AuthMode::Anonymous,
            ..StoreConfig::default()
        };
        assert!(config.resolve_token(AuthToken::anonymous()).is_ok());
    }
}
