use std::sync::Arc;

use tether_model::{AllocDir, AllocId};
use tracing::Span;

use crate::config::HostConfig;

/// Per-task, per-driver context. Owned by the driver instance.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub task_name: String,
    pub host: Arc<HostConfig>,
    /// Span carrying `driver` and `task` fields; everything the driver logs and the
    /// monitors it spawns run inside it.
    pub span: Span,
}

impl DriverContext {
    pub fn new(driver: &str, task_name: impl Into<String>, host: Arc<HostConfig>) -> Self {
        let task_name = task_name.into();
        let span = tracing::info_span!("driver", driver = %driver, task = %task_name);
        Self {
            task_name,
            host,
            span,
        }
    }
}

/// Per-launch context, borrowed by `start` and `open`.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub alloc_id: AllocId,
    pub alloc_dir: AllocDir,
}

impl ExecContext {
    pub fn new(alloc_id: impl Into<AllocId>, alloc_dir: AllocDir) -> Self {
        Self {
            alloc_id: alloc_id.into(),
            alloc_dir,
        }
    }
}
