//! # helm-cron
//!
//! Cron-driven scheduler for named `(module, action)` tasks with manual
//! `run_now`, runtime enable/disable, a per-task skip lock, and persisted
//! run history.

#![deny(unsafe_code)]

pub mod error;
pub mod handler;
pub mod schedule;
pub mod scheduler;

pub use error::SchedulerError;
pub use handler::ActionHandler;
pub use schedule::{normalize, parse_cron};
pub use scheduler::{Scheduler, SchedulerDeps, TaskOutcome, TaskStatus};
