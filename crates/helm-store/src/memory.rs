//! In-memory implementation of the persistence traits.
//!
//! Used when the configured database path is `:memory:` and throughout the
//! test suites of the crates above this one. Nothing survives a restart.
//! The action log keeps only the newest [`DEFAULT_LOG_CAPACITY`] entries.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use helm_core::events::iso_now;
use helm_core::{
    ActionLog, ActionLogEntry, ApprovalQueue, ApprovalRequest, ApprovalStatus, KeyValueStore,
    StoreError,
};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

/// Action log entries kept by [`MemoryStore::new`].
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Process-local store.
pub struct MemoryStore {
    kv: Mutex<HashMap<String, Value>>,
    log: Mutex<VecDeque<ActionLogEntry>>,
    log_capacity: usize,
    approvals: Mutex<Vec<ApprovalRequest>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store whose action log evicts the oldest entry past `capacity`.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            kv: Mutex::new(HashMap::new()),
            log: Mutex::new(VecDeque::new()),
            log_capacity: capacity.max(1),
            approvals: Mutex::new(Vec::new()),
        }
    }

    fn transition(
        &self,
        id: &str,
        from: ApprovalStatus,
        to: ApprovalStatus,
    ) -> Result<ApprovalRequest, StoreError> {
        let mut approvals = self.approvals.lock();
        let request = approvals
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if request.status != from {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                status: request.status.as_str().to_string(),
            });
        }
        request.status = to;
        if request.resolved_at.is_none() {
            request.resolved_at = Some(iso_now());
        }
        Ok(request.clone())
    }

    /// Number of action log entries recorded so far.
    pub fn log_len(&self) -> usize {
        self.log.lock().len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.kv.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let _ = self.kv.lock().insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl ActionLog for MemoryStore {
    async fn record(&self, entry: ActionLogEntry) -> Result<(), StoreError> {
        let mut log = self.log.lock();
        if log.len() == self.log_capacity {
            let _ = log.pop_front();
        }
        log.push_back(entry);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ActionLogEntry>, StoreError> {
        Ok(self.log.lock().iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl ApprovalQueue for MemoryStore {
    async fn enqueue(
        &self,
        action_type: &str,
        action_data: Value,
    ) -> Result<ApprovalRequest, StoreError> {
        let request = ApprovalRequest {
            id: Uuid::now_v7().to_string(),
            action_type: action_type.to_string(),
            action_data,
            status: ApprovalStatus::Pending,
            created_at: iso_now(),
            resolved_at: None,
        };
        self.approvals.lock().push(request.clone());
        Ok(request)
    }

    async fn get(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.approvals.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
    ) -> Result<ApprovalRequest, StoreError> {
        self.transition(id, ApprovalStatus::Pending, status)
    }

    async fn mark_executed(&self, id: &str) -> Result<ApprovalRequest, StoreError> {
        self.transition(id, ApprovalStatus::Approved, ApprovalStatus::Executed)
    }

    async fn pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(self
            .approvals
            .lock()
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect())
    }
}
