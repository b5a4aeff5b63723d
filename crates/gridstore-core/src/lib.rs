//! # gridstore-core
//!
//! The abstract wide-column object store underlying a forensic
//! agent-management platform. `gridstore-core` persists a universe of
//! **subjects** (hierarchical URN-addressed rows), each carrying a set of
//! timestamped **attribute cells**, and layers on top of this substrate a
//! family of higher-level access patterns: advisory subject locks, a
//! client-side mutation pool, scheduled task queues, flow request/response
//! tracking, append-only sequential collections and record queues,
//! keyword/label/file-hash/directory-child indexes, a stats time series,
//! session notifications, and blob storage passthrough.
//!
//! Concrete physical backends (SQL, on-disk B-tree, cloud tables), blob
//! byte storage, access-control token validation, wire serialization of
//! user-facing record payloads, configuration loading, and shell entry
//! points are external collaborators, referenced here only through the
//! small traits this crate exposes to or consumes from them
//! ([`backend::Backend`], [`blob::BlobStore`]).
//!
//! [`store::GridStore`] is the top-level handle: it owns the configured
//! backend, starts the background flusher and size-monitor loops, and
//! exposes facade methods that route to the pattern operator modules.
//! Every pattern operator is also usable directly against any
//! `&dyn Backend` plus a borrowed [`pool::MutationPool`], without going
//! through `GridStore` at all.

pub mod backend;
pub mod blob;
pub mod collections;
pub mod concurrency;
pub mod config;
pub mod dir_index;
pub mod error;
pub mod file_hash;
pub mod flow;
pub mod index;
pub mod labels;
pub mod lock;
pub mod model;
pub mod monitoring;
pub mod notify;
pub mod pool;
pub mod queue;
pub mod records;
pub mod stats_store;
pub mod store;

pub use backend::Backend;
pub use blob::BlobStore;
pub use config::{AuthMode, AuthToken, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use lock::{LockGuard, SubjectLock};
pub use model::{Attribute, Cell, Subject, Timestamp, TimestampSpec, Value};
pub use monitoring::StoreMetrics;
pub use pool::{MutationPool, PoolGuard};
pub use store::GridStore;
