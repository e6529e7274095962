//! Persistence traits consumed by the control plane.
//!
//! The rate limiter and scheduler persist through [`KeyValueStore`]; the
//! scheduler and dry-run gate write to [`ActionLog`]; the approval gate
//! reads and resolves requests through [`ApprovalQueue`]. Implementations
//! live in `helm-store`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or returned an error.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The referenced record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// The record exists but is not in the state the update requires.
    #[error("record {id} is {status}")]
    Conflict {
        /// Record ID.
        id: String,
        /// State it was found in.
        status: String,
    },
}

/// Asynchronous key-value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value; `None` if the key was never set.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write (or overwrite) a value.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Outcome recorded for an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// The action ran and succeeded.
    Success,
    /// The action ran and failed.
    Error,
    /// Dry-run: the action was logged instead of executed.
    Simulated,
    /// The action was not run because a previous run was still in flight.
    Skipped,
}

impl ActionStatus {
    /// Stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Simulated => "simulated",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "simulated" => Some(Self::Simulated),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One row of the action log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    /// Module that owns the action (e.g. `"browser"`).
    pub module: String,
    /// Action name within the module.
    pub action: String,
    /// Outcome.
    pub status: ActionStatus,
    /// Wall time spent, if the action ran.
    pub duration_ms: Option<u64>,
    /// Error message on failure.
    pub error: Option<String>,
    /// Free-form structured details (parameters, results).
    pub details: Option<Value>,
    /// ISO-8601 timestamp.
    pub created_at: String,
}

impl ActionLogEntry {
    /// Start an entry stamped with the current time.
    pub fn new(module: impl Into<String>, action: impl Into<String>, status: ActionStatus) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
            status,
            duration_ms: None,
            error: None,
            details: None,
            created_at: crate::events::iso_now(),
        }
    }

    /// Attach a duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Append-only log of executed, failed, simulated, and skipped actions.
#[async_trait]
pub trait ActionLog: Send + Sync {
    /// Append an entry.
    async fn record(&self, entry: ActionLogEntry) -> Result<(), StoreError>;

    /// Most recent entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ActionLogEntry>, StoreError>;
}

/// Lifecycle of an approval request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Waiting for a human decision.
    Pending,
    /// Cleared to execute.
    Approved,
    /// Must not execute.
    Rejected,
    /// Approved and already run; cannot run again.
    Executed,
}

impl ApprovalStatus {
    /// Stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "executed" => Some(Self::Executed),
            _ => None,
        }
    }
}

/// A side-effecting action awaiting human confirmation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Request ID.
    pub id: String,
    /// Action type being gated.
    pub action_type: String,
    /// Parameters of the gated action.
    pub action_data: Value,
    /// Current status.
    pub status: ApprovalStatus,
    /// ISO-8601 creation time.
    pub created_at: String,
    /// ISO-8601 resolution time.
    pub resolved_at: Option<String>,
}

/// Queue of approval requests.
#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    /// Create a pending request; returns it with its new ID.
    async fn enqueue(
        &self,
        action_type: &str,
        action_data: Value,
    ) -> Result<ApprovalRequest, StoreError>;

    /// Look up a request.
    async fn get(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Decide a pending request. Fails with [`StoreError::Conflict`] if the
    /// request has already been decided.
    async fn resolve(&self, id: &str, status: ApprovalStatus)
    -> Result<ApprovalRequest, StoreError>;

    /// Claim an approved request for execution, moving it to
    /// [`ApprovalStatus::Executed`]. Only one caller can win the claim;
    /// every other gets [`StoreError::Conflict`].
    async fn mark_executed(&self, id: &str) -> Result<ApprovalRequest, StoreError>;

    /// All requests still pending, oldest first.
    async fn pending(&self) -> Result<Vec<ApprovalRequest>, StoreError>;
}
