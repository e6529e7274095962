//! # helm-core
//!
//! Foundation types shared by every helm crate:
//!
//! - [`events`]: broadcast event types, the [`EventEnvelope`] wire shape, and
//!   the process-wide [`EventBus`] that components publish to
//! - [`store`]: persistence traits ([`KeyValueStore`], [`ActionLog`],
//!   [`ApprovalQueue`]) consumed by the rate limiter, scheduler, and gates
//! - [`clock`]: injectable wall-clock source
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod clock;
pub mod events;
pub mod logging;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{AgentEvent, BroadcastEventType, EventBus, EventEnvelope};
pub use store::{
    ActionLog, ActionLogEntry, ActionStatus, ApprovalQueue, ApprovalRequest, ApprovalStatus,
    KeyValueStore, StoreError,
};
