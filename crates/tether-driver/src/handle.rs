//! Handle to a running task.
//!
//! ## Lifecycle
//!
//! ```text
//! spawn ──► Running ──(executor.wait returns)──► Exited
//!              │                                   ▲
//!              └── kill: SIGTERM ─ grace ─ SIGKILL ┘
//! ```
//!
//! Every handle owns one monitor task. The monitor calls [`Executor::wait`] exactly once,
//! then cancels the done token and only afterwards publishes the [`WaitResult`] on the
//! completion channel. Consumers that observe a result can therefore rely on
//! [`TaskHandle::has_exited`] being `true`.
use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tether_exec::Executor;
use tether_model::{TaskSpec, WaitResult};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use crate::error::DriverError;

/// Time a task gets to exit after SIGTERM before it is force-stopped.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct TaskHandle {
    id: String,
    exec: Arc<dyn Executor>,
    done: CancellationToken,
    result_rx: Mutex<Option<oneshot::Receiver<WaitResult>>>,
    monitor: JoinHandle<()>,
    grace: Duration,
    span: Span,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    /// Take ownership of a started (or located) executor and start its monitor.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(exec: Arc<dyn Executor>, span: Span) -> Result<Self, DriverError> {
        let id = exec.id()?;
        let done = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let monitor = {
            let exec = Arc::clone(&exec);
            let done = done.clone();
            tokio::spawn(
                async move {
                    // Cancels `done` on every exit path, including a panic in `wait`.
                    let guard = done.drop_guard();
                    let res = exec.wait().await;
                    drop(guard);

                    info!(result = %res, "task exited");
                    let _ = tx.send(res);
                }
                .instrument(span.clone()),
            )
        };

        Ok(Self {
            id,
            exec,
            done,
            result_rx: Mutex::new(Some(rx)),
            monitor,
            grace: KILL_GRACE,
            span,
        })
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Identifier to persist; `Driver::open` accepts it after an agent restart.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Completion channel. Only the first caller gets it.
    pub fn wait_ch(&self) -> Option<oneshot::Receiver<WaitResult>> {
        self.result_rx.lock().take()
    }

    pub fn has_exited(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the workload has exited.
    pub async fn exited(&self) {
        self.done.cancelled().await
    }

    /// Whether the monitor task has finished, i.e. the result was published.
    pub fn is_finished(&self) -> bool {
        self.monitor.is_finished()
    }

    /// In-place updates are not supported by any backend; always succeeds.
    pub async fn update(&self, task: &TaskSpec) -> Result<(), DriverError> {
        debug!(parent: &self.span, task = %task.name, "update is a no-op");
        Ok(())
    }

    /// Stop the task: SIGTERM, wait up to the grace period, then force-stop.
    ///
    /// Returns `Ok` right away once the task has exited; concurrent calls are safe.
    pub async fn kill(&self) -> Result<(), DriverError> {
        if self.done.is_cancelled() {
            return Ok(());
        }

        if let Err(e) = self.exec.shutdown().await {
            warn!(parent: &self.span, error = %e, "graceful shutdown failed; escalating");
        }

        tokio::select! {
            biased;
            _ = self.done.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.grace) => {}
        }

        warn!(parent: &self.span, grace = ?self.grace, "task ignored shutdown; force stopping");
        self.exec
            .force_stop()
            .await
            .map_err(|e| DriverError::Termination(e.to_string()))
    }
}
