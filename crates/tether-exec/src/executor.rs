use async_trait::async_trait;
use tether_model::WaitResult;

use crate::error::ExecResult;

/// Lifecycle contract shared by every backend that can be tracked by a handle.
///
/// `shutdown` and `force_stop` must be safe to call while another task is blocked in
/// `wait`, and must treat an already-exited workload as success.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Identifier that lets the backend find the workload again after an agent restart.
    fn id(&self) -> ExecResult<String>;

    /// Block until the workload exits. Only the first call observes the real outcome.
    async fn wait(&self) -> WaitResult;

    /// Ask the workload to stop. Does not wait for it.
    async fn shutdown(&self) -> ExecResult<()>;

    /// Terminate the workload unconditionally.
    async fn force_stop(&self) -> ExecResult<()>;
}
