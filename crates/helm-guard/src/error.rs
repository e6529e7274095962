//! Safety gate errors.

use helm_core::{ApprovalStatus, StoreError};
use thiserror::Error;

/// Errors from the approval gate and the composed safety gate.
///
/// Rate limiting and pending approval are outcomes, not errors; see
/// [`GateResult`](crate::GateResult).
#[derive(Debug, Error)]
pub enum GuardError {
    /// The persistence backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No approval request with this ID exists.
    #[error("unknown approval request '{id}'")]
    UnknownApproval {
        /// Requested ID.
        id: String,
    },

    /// The request was already approved or rejected.
    #[error("approval request '{id}' already {status:?}")]
    AlreadyResolved {
        /// Request ID.
        id: String,
        /// Existing decision.
        status: ApprovalStatus,
    },

    /// The request has not been approved.
    #[error("approval request '{id}' is {status:?}, not approved")]
    NotApproved {
        /// Request ID.
        id: String,
        /// Current status.
        status: ApprovalStatus,
    },

    /// No decision arrived before the deadline.
    #[error("no decision on approval request '{id}' after {timeout_ms}ms")]
    ApprovalTimeout {
        /// Request ID.
        id: String,
        /// How long we waited.
        timeout_ms: u64,
    },
}
