//! # Concurrency Model and Lock Hierarchy Documentation
//!
//! This module documents the concurrency model used throughout
//! `gridstore-core`. Following these guidelines prevents deadlocks between
//! the store handle, subject locks and the backend.
//!
//! ## Lock Hierarchy Overview
//!
//! Locks are acquired top-down, from **Level 1 (highest)** to **Level 4
//! (lowest)**. Never acquire a higher-level lock while holding a
//! lower-level one.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    GRIDSTORE LOCK HIERARCHY                      │
//! │                                                                   │
//! │  Level 1 (Top)   ┌───────────────────────────────────┐           │
//! │  Store           │  Arc<GridStore>                    │           │
//! │                  └───────────────────────────────────┘           │
//! │                                 │                                 │
//! │                                 ▼                                 │
//! │  Level 2         ┌───────────────────────────────────┐           │
//! │  Mutation Pool   │  MutationPool (per caller, owned)  │           │
//! │                  └───────────────────────────────────┘           │
//! │                                 │                                 │
//! │                                 ▼                                 │
//! │  Level 3         ┌───────────────────────────────────┐           │
//! │  Subject Lock    │  SubjectLock (advisory, per-URN)   │           │
//! │                  └───────────────────────────────────┘           │
//! │                                 │                                 │
//! │                                 ▼                                 │
//! │  Level 4 (Bottom) ┌───────────────────────────────────┐          │
//! │  Backend          │  dyn Backend (DashMap-sharded)     │          │
//! │                   └───────────────────────────────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A subject lock (Level 3) is advisory — it is itself implemented as
//! cells in the backend (Level 4), so acquiring one issues backend calls.
//! Holding a subject lock while starting to flush an unrelated
//! `MutationPool` is safe because pools never take the store-level lock;
//! they only ever talk to the backend directly.
//!
//! ## Lock Types and Usage Guidelines
//!
//! ### `tokio::sync::RwLock` / `DashMap`
//!
//! Long-lived shared state (the background loops' stop signal, the
//! monitoring counters) uses `tokio::sync::RwLock` so it never blocks the
//! async executor. High-contention per-key state — the in-memory
//! backend's row map — uses `DashMap`, which shards its internal locking
//! and avoids a single global lock for unrelated subjects.
//!
//! **When to use `tokio::sync::RwLock`:**
//! - Any state accessed from async functions
//! - Shared counters polled by the size-monitor loop
//!
//! **When to use `DashMap`:**
//! - Per-subject maps where independent subjects must not contend
//!
//! ## Deadlock Avoidance Rules
//!
//! 1. Never hold a subject lock across an `.await` that acquires a
//!    *different* subject's lock — acquire all locks a single operation
//!    needs up front, in sorted subject order, or acquire them one at a
//!    time and release before moving to the next subject.
//! 2. Never call back into `GridStore` methods while holding a
//!    `MutationPool`'s internal buffer lock.
//! 3. Background loops (flusher, size monitor) never hold a lock across
//!    more than one backend call; they poll, act, and release.
//!
//! ## Performance Considerations
//!
//! - **Use `read()` when possible**: multiple readers proceed concurrently.
//! - **Batch writes**: a `MutationPool` exists precisely to batch multiple
//!   mutations under one backend `Flush`.
//! - **Clone data out**: `Value`'s `Arc`-backed variants make this cheap.

use std::fmt;

/// Lock level in the hierarchy (lower number = higher priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    /// Level 1: the store handle itself.
    Store = 1,
    /// Level 2: a caller-owned mutation pool.
    MutationPool = 2,
    /// Level 3: an advisory per-subject lock.
    SubjectLock = 3,
    /// Level 4: the backend.
    Backend = 4,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => write!(f, "Level 1 (Store)"),
            Self::MutationPool => write!(f, "Level 2 (MutationPool)"),
            Self::SubjectLock => write!(f, "Level 3 (SubjectLock)"),
            Self::Backend => write!(f, "Level 4 (Backend)"),
        }
    }
}
