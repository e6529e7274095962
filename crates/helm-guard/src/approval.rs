//! Human-in-the-loop approval gate.
//!
//! Requests go into an [`ApprovalQueue`] and are announced on the event bus
//! as `approval:requested`. A decision arrives through [`ApprovalGate::resolve`],
//! is persisted, announced as `approval:resolved`, and wakes anyone blocked in
//! [`ApprovalGate::wait_for_decision`]. An approved request runs at most once:
//! [`ApprovalGate::claim`] moves it to `executed` before the action starts.

use std::sync::Arc;
use std::time::Duration;

use helm_core::{
    ApprovalQueue, ApprovalRequest, ApprovalStatus, BroadcastEventType, EventBus, StoreError,
};
use helm_settings::ApprovalSettings;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::GuardError;

/// Answer from [`ApprovalGate::request_approval`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// No approval needed; go ahead.
    Approved,
    /// Queued for a human; do not execute yet.
    Pending {
        /// ID to resolve or wait on.
        approval_id: String,
    },
}

/// Approval gate over a persisted queue.
pub struct ApprovalGate {
    queue: Arc<dyn ApprovalQueue>,
    bus: EventBus,
    settings: ApprovalSettings,
    decisions: broadcast::Sender<(String, ApprovalStatus)>,
}

impl ApprovalGate {
    /// Gate with the given policy.
    pub fn new(queue: Arc<dyn ApprovalQueue>, bus: EventBus, settings: ApprovalSettings) -> Self {
        let (decisions, _) = broadcast::channel(64);
        Self {
            queue,
            bus,
            settings,
            decisions,
        }
    }

    /// Whether `action_type` must wait for a human decision.
    pub fn requires_approval(&self, action_type: &str) -> bool {
        self.settings.requires(action_type)
    }

    /// Approve immediately if the policy allows, otherwise enqueue a request.
    pub async fn request_approval(
        &self,
        action_type: &str,
        action_data: Value,
    ) -> Result<ApprovalDecision, GuardError> {
        if !self.requires_approval(action_type) {
            return Ok(ApprovalDecision::Approved);
        }
        let request = self.queue.enqueue(action_type, action_data).await?;
        info!(approval_id = %request.id, action_type, "approval requested");
        self.bus.emit(
            BroadcastEventType::ApprovalRequested,
            json!({
                "approvalId": request.id,
                "actionType": request.action_type,
                "actionData": request.action_data,
            }),
        );
        Ok(ApprovalDecision::Pending {
            approval_id: request.id,
        })
    }

    /// Look up a request.
    pub async fn get(&self, id: &str) -> Result<ApprovalRequest, GuardError> {
        self.queue
            .get(id)
            .await?
            .ok_or_else(|| GuardError::UnknownApproval { id: id.to_string() })
    }

    /// Requests still waiting, oldest first.
    pub async fn pending(&self) -> Result<Vec<ApprovalRequest>, GuardError> {
        Ok(self.queue.pending().await?)
    }

    /// Record a decision on a pending request. Only the first decision
    /// sticks; later ones fail with [`GuardError::AlreadyResolved`].
    pub async fn resolve(&self, id: &str, approved: bool) -> Result<ApprovalRequest, GuardError> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let resolved = match self.queue.resolve(id, status).await {
            Ok(resolved) => resolved,
            Err(StoreError::NotFound(_)) => {
                return Err(GuardError::UnknownApproval { id: id.to_string() });
            }
            Err(StoreError::Conflict { .. }) => {
                return Err(GuardError::AlreadyResolved {
                    id: id.to_string(),
                    status: self.get(id).await?.status,
                });
            }
            Err(e) => return Err(e.into()),
        };
        info!(approval_id = id, status = status.as_str(), "approval resolved");
        self.bus.emit(
            BroadcastEventType::ApprovalResolved,
            json!({
                "approvalId": resolved.id,
                "actionType": resolved.action_type,
                "status": status.as_str(),
            }),
        );
        let _ = self.decisions.send((resolved.id.clone(), status));
        Ok(resolved)
    }

    /// Take the right to execute approved request `id`. Succeeds for exactly
    /// one caller; the request is `executed` afterwards.
    pub async fn claim(&self, id: &str) -> Result<ApprovalRequest, GuardError> {
        match self.queue.mark_executed(id).await {
            Ok(claimed) => {
                info!(approval_id = id, "approved action claimed");
                Ok(claimed)
            }
            Err(StoreError::NotFound(_)) => Err(GuardError::UnknownApproval { id: id.to_string() }),
            Err(StoreError::Conflict { .. }) => Err(GuardError::NotApproved {
                id: id.to_string(),
                status: self.get(id).await?.status,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until request `id` is approved or rejected.
    pub async fn wait_for_decision(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<ApprovalStatus, GuardError> {
        let mut rx = self.decisions.subscribe();
        let status = self.get(id).await?.status;
        if status != ApprovalStatus::Pending {
            return Ok(status);
        }

        tokio::time::timeout(timeout, self.next_decision(&mut rx, id))
            .await
            .map_err(|_| GuardError::ApprovalTimeout {
                id: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn next_decision(
        &self,
        rx: &mut broadcast::Receiver<(String, ApprovalStatus)>,
        id: &str,
    ) -> Result<ApprovalStatus, GuardError> {
        loop {
            match rx.recv().await {
                Ok((resolved, status)) if resolved == id => return Ok(status),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let status = self.get(id).await?.status;
                    if status != ApprovalStatus::Pending {
                        return Ok(status);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(self.get(id).await?.status),
            }
        }
    }
}
