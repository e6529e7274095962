//! The composed safety gate: rate limit, then approval, then dry-run.

use std::future::Future;
use std::sync::Arc;

use helm_core::ApprovalStatus;
use serde_json::Value;
use tracing::debug;

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::dry_run::{DryRun, GateOutcome, SimulatedAction};
use crate::error::GuardError;
use crate::rate_limiter::{RateLimitStatus, RateLimiter};

/// What happened to a gated action.
#[derive(Debug)]
pub enum GateResult<T> {
    /// No token available; nothing ran.
    RateLimited(RateLimitStatus),
    /// Queued for approval; nothing ran.
    PendingApproval {
        /// ID to resolve.
        approval_id: String,
    },
    /// Dry-run is on; logged instead of run.
    Simulated(SimulatedAction),
    /// The action ran; here is its output.
    Executed(T),
}

impl<T> GateResult<T> {
    /// Short label for logs and action-log details.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::PendingApproval { .. } => "pending_approval",
            Self::Simulated(_) => "simulated",
            Self::Executed(_) => "executed",
        }
    }
}

/// Wraps side-effecting calls in every safety check.
#[derive(Clone)]
pub struct SafetyGate {
    limiter: Arc<RateLimiter>,
    approvals: Arc<ApprovalGate>,
    dry_run: Arc<DryRun>,
}

impl SafetyGate {
    /// Compose the three gates.
    pub fn new(limiter: Arc<RateLimiter>, approvals: Arc<ApprovalGate>, dry_run: Arc<DryRun>) -> Self {
        Self {
            limiter,
            approvals,
            dry_run,
        }
    }

    /// Rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Approval gate.
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// Dry-run switch.
    pub fn dry_run(&self) -> &Arc<DryRun> {
        &self.dry_run
    }

    /// Run `f` as `action_type` if every gate lets it through.
    ///
    /// A token is consumed only when `f` actually runs.
    pub async fn execute<T, F, Fut>(
        &self,
        action_type: &str,
        params: Value,
        f: F,
    ) -> Result<GateResult<T>, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let status = self.limiter.check_limit(action_type).await;
        if !status.allowed {
            debug!(action_type, "gate: rate limited");
            return Ok(GateResult::RateLimited(status));
        }

        if let ApprovalDecision::Pending { approval_id } = self
            .approvals
            .request_approval(action_type, params.clone())
            .await?
        {
            debug!(action_type, %approval_id, "gate: awaiting approval");
            return Ok(GateResult::PendingApproval { approval_id });
        }

        Ok(self.run(action_type, params, f).await)
    }

    /// Run a previously queued action once its request is approved.
    ///
    /// Rate limit and dry-run still apply; approval is not asked again. The
    /// request is claimed before `f` runs, so each approval runs at most
    /// once. A rate-limited attempt leaves the request approved for a retry.
    pub async fn execute_approved<T, F, Fut>(
        &self,
        approval_id: &str,
        f: F,
    ) -> Result<GateResult<T>, GuardError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = T>,
    {
        let request = self.approvals.get(approval_id).await?;
        if request.status != ApprovalStatus::Approved {
            return Err(GuardError::NotApproved {
                id: approval_id.to_string(),
                status: request.status,
            });
        }
        let status = self.limiter.check_limit(&request.action_type).await;
        if !status.allowed {
            return Ok(GateResult::RateLimited(status));
        }
        let request = self.approvals.claim(approval_id).await?;
        let data = request.action_data.clone();
        Ok(self
            .run(&request.action_type, request.action_data, move || f(data))
            .await)
    }

    async fn run<T, F, Fut>(&self, action_type: &str, params: Value, f: F) -> GateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.dry_run.is_enabled() && !self.limiter.record_action(action_type).await {
            return GateResult::RateLimited(self.limiter.check_limit(action_type).await);
        }
        match self.dry_run.wrap(action_type, params, f).await {
            GateOutcome::Executed(out) => GateResult::Executed(out),
            GateOutcome::Simulated(sim) => GateResult::Simulated(sim),
        }
    }
}
