//! # helm-guard
//!
//! Gates for side-effecting actions.
//!
//! - [`RateLimiter`]: persisted per-action-type token buckets
//! - [`DryRun`]: simulate instead of execute, toggleable at runtime
//! - [`ApprovalGate`]: queue actions for a human decision
//! - [`SafetyGate`]: all three composed, in that order

#![deny(unsafe_code)]

pub mod approval;
pub mod bucket;
pub mod dry_run;
pub mod error;
pub mod gate;
pub mod rate_limiter;

pub use approval::{ApprovalDecision, ApprovalGate};
pub use dry_run::{DryRun, GateOutcome, SimulatedAction};
pub use error::GuardError;
pub use gate::{GateResult, SafetyGate};
pub use rate_limiter::{Limit, RateLimitStatus, RateLimiter};
