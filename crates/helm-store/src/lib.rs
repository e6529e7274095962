//! # helm-store
//!
//! Persistence backends for the [`helm_core::store`] traits.
//!
//! - [`SqliteStore`]: pooled `SQLite` database with embedded migrations
//! - [`MemoryStore`]: process-local maps for tests and `:memory:` configs

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod memory;
pub mod migrations;
pub mod sqlite;

use std::sync::Arc;

use helm_core::{ActionLog, ApprovalQueue, KeyValueStore};

pub use connection::PoolConfig;
pub use errors::SqliteStoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Path value selecting the in-memory backend.
pub const MEMORY_PATH: &str = ":memory:";

/// Handles to one backend, split by the trait each consumer needs.
#[derive(Clone)]
pub struct Stores {
    /// Rate-limit buckets and schedule run history.
    pub kv: Arc<dyn KeyValueStore>,
    /// Action log.
    pub log: Arc<dyn ActionLog>,
    /// Approval queue.
    pub approvals: Arc<dyn ApprovalQueue>,
}

impl Stores {
    fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: KeyValueStore + ActionLog + ApprovalQueue + 'static,
    {
        Self {
            kv: backend.clone(),
            log: backend.clone(),
            approvals: backend,
        }
    }

    /// Fresh [`MemoryStore`] behind every handle.
    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }
}

/// Open the backend selected by `path`: [`MemoryStore`] for `:memory:`,
/// otherwise a [`SqliteStore`] file.
pub fn open(path: &str) -> errors::Result<Stores> {
    if path == MEMORY_PATH {
        return Ok(Stores::memory());
    }
    Ok(Stores::from_backend(Arc::new(SqliteStore::open(path)?)))
}
