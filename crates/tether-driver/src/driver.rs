use async_trait::async_trait;
use tether_model::{NodeAttributes, TaskSpec};

use crate::{
    config::HostConfig, context::ExecContext, error::DriverError, handle::TaskHandle,
};

/// A backend that can run tasks on this node.
///
/// Instances are created per task with a [`DriverContext`](crate::DriverContext).
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe the host and publish facts for this backend.
    ///
    /// `Ok(false)` leaves `node` untouched; an error means the backend is present but
    /// could not be understood.
    async fn fingerprint(
        &self,
        cfg: &HostConfig,
        node: &mut NodeAttributes,
    ) -> Result<bool, DriverError>;

    /// Launch `task`. The returned handle's monitor is already running.
    async fn start(&self, ctx: &ExecContext, task: &TaskSpec) -> Result<TaskHandle, DriverError>;

    /// Re-attach to a task launched by an earlier agent run, given [`TaskHandle::id`].
    async fn open(&self, ctx: &ExecContext, id: &str) -> Result<TaskHandle, DriverError>;
}
