//! Scheduler errors.

use helm_core::StoreError;
use thiserror::Error;

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No configured task has this name.
    #[error("unknown task '{name}'")]
    UnknownTask {
        /// Requested name.
        name: String,
    },

    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// Expression as configured.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// The persistence backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
