//! Content-addressed blob storage passthrough.
//!
//! Large opaque payloads (file contents, memory dumps) do not belong in
//! the row/attribute/timestamp data model at all — they are addressed
//! by content hash and stored wherever the deployment's blob
//! infrastructure lives. This module only defines the seam: the rest of
//! the store delegates `ReadBlob(s)`, `StoreBlob(s)`, `BlobsExist`, and
//! `DeleteBlob(s)` to [`BlobStore`] verbatim, never touching a concrete
//! implementation, which is out of scope here.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future;

use crate::error::StoreResult;

/// A content-addressed blob collaborator.
///
/// Implementations are expected to be content-addressed themselves (the
/// same `hash` always yields the same bytes), so `store_blob` is
/// naturally idempotent and callers never need to check existence
/// before writing.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `hash`, overwriting nothing if already present.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn store_blob(&self, hash: &str, data: &[u8]) -> StoreResult<()>;

    /// Fetches the bytes stored under `hash`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn read_blob(&self, hash: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns `true` if `hash` is already stored.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn blob_exists(&self, hash: &str) -> StoreResult<bool> {
        Ok(self.read_blob(hash).await?.is_some())
    }

    /// Deletes the blob stored under `hash`. Idempotent: deleting an
    /// absent hash is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn delete_blob(&self, hash: &str) -> StoreResult<()>;

    /// Stores every `(hash, data)` pair in `blobs`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn store_blobs(&self, blobs: &[(String, Vec<u8>)]) -> StoreResult<()> {
        future::try_join_all(blobs.iter().map(|(hash, data)| self.store_blob(hash, data))).await?;
        Ok(())
    }

    /// Fetches every hash in `hashes`, keyed by hash, omitting absent ones.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn read_blobs(&self, hashes: &[String]) -> StoreResult<HashMap<String, Vec<u8>>> {
        let results = future::try_join_all(hashes.iter().map(|hash| self.read_blob(hash))).await?;
        Ok(hashes
            .iter()
            .cloned()
            .zip(results)
            .filter_map(|(hash, data)| data.map(|data| (hash, data)))
            .collect())
    }

    /// Checks presence of every hash in `hashes`, keyed by hash.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn blobs_exist(&self, hashes: &[String]) -> StoreResult<HashMap<String, bool>> {
        let results = future::try_join_all(hashes.iter().map(|hash| self.blob_exists(hash))).await?;
        Ok(hashes.iter().cloned().zip(results).collect())
    }

    /// Deletes every hash in `hashes`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::StoreError`] on any underlying failure.
    async fn delete_blobs(&self, hashes: &[String]) -> StoreResult<()> {
        future::try_join_all(hashes.iter().map(|hash| self.delete_blob(hash))).await?;
        Ok(())
    }
}
