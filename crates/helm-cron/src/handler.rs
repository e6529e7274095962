//! The seam between the scheduler and whatever actually does the work.

use async_trait::async_trait;

/// Executes a task's `(module, action)` pair.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run one action. Errors are logged by the scheduler; they never stop it.
    async fn run_task(&self, module: &str, action: &str) -> anyhow::Result<()>;
}
