//! Fork/exec driver.
use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tether_exec::{ExecError, Executor, Isolation, ProcConfig, ProcessExecutor, ResourceLimits};
use tether_model::{DriverConfig, NodeAttributes, TaskSpec};
use tracing::{debug, info};

use crate::{
    artifact::{ArtifactFetcher, FsFetcher},
    config::{HostConfig, OPT_EXEC_CGROUP_ROOT},
    context::{DriverContext, ExecContext},
    driver::Driver,
    env::{assign_dynamic_ports, task_env},
    error::DriverError,
    fingerprint::{is_root_on_linux, publish_driver},
    handle::TaskHandle,
};

pub const NAME: &str = "exec";

pub struct ExecDriver {
    ctx: DriverContext,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl ExecDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            fetcher: Arc::new(FsFetcher),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }
}

#[async_trait]
impl Driver for ExecDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fingerprint(
        &self,
        cfg: &HostConfig,
        node: &mut NodeAttributes,
    ) -> Result<bool, DriverError> {
        if !is_root_on_linux() {
            debug!(parent: &self.ctx.span, "exec requires root on linux; disabled");
            return Ok(false);
        }
        publish_driver(node, NAME, [("isolation", isolation(cfg).as_str())]);
        Ok(true)
    }

    async fn start(&self, ctx: &ExecContext, task: &TaskSpec) -> Result<TaskHandle, DriverError> {
        let command = task.config.require("command")?.to_string();
        let args = split_args(&task.config, "args")?;

        fetch_artifact(&self.ctx, ctx, self.fetcher.as_ref(), &task.config, false).await?;
        launch(&self.ctx, ctx, task, command, args).await
    }

    async fn open(&self, _ctx: &ExecContext, id: &str) -> Result<TaskHandle, DriverError> {
        reattach(&self.ctx, id)
    }
}

/// Isolation configured for process-backed drivers on this host.
pub(crate) fn isolation(host: &HostConfig) -> Isolation {
    match host.option(OPT_EXEC_CGROUP_ROOT) {
        Some(root) => Isolation::Cgroup { root: root.into() },
        None => Isolation::Rlimit,
    }
}

/// Shell-word split of an optional config value.
pub(crate) fn split_args(cfg: &DriverConfig, key: &str) -> Result<Vec<String>, DriverError> {
    match cfg.get(key) {
        None => Ok(Vec::new()),
        Some(raw) => shlex::split(raw)
            .ok_or_else(|| DriverError::Config(format!("'{key}' has unbalanced quotes"))),
    }
}

/// Fetch `artifact_source` (verified against `checksum`) into the task's `local/` dir.
pub(crate) async fn fetch_artifact(
    ctx: &DriverContext,
    exec_ctx: &ExecContext,
    fetcher: &dyn ArtifactFetcher,
    cfg: &DriverConfig,
    required: bool,
) -> Result<Option<PathBuf>, DriverError> {
    let source = if required {
        cfg.require("artifact_source")?
    } else {
        match cfg.get("artifact_source") {
            Some(source) => source,
            None => return Ok(None),
        }
    };
    let local = exec_ctx
        .alloc_dir
        .task_local_dir(&ctx.task_name)
        .ok_or_else(|| ExecError::TaskDirMissing(ctx.task_name.clone()))?;

    fetcher
        .fetch(source, cfg.get("checksum"), &local)
        .await
        .map(Some)
}

/// Configure, bind and start a process for `task`, then hand it to a monitor.
pub(crate) async fn launch(
    ctx: &DriverContext,
    exec_ctx: &ExecContext,
    task: &TaskSpec,
    program: String,
    args: Vec<String>,
) -> Result<TaskHandle, DriverError> {
    let mut resources = task.resources.clone();
    if let Some(res) = resources.as_mut() {
        assign_dynamic_ports(res)?;
    }
    let env = task_env(exec_ctx, task, resources.as_ref());
    let limits = resources.as_ref().map(ResourceLimits::from);

    let cfg = ProcConfig::new(program).with_args(args).with_env(env);
    let mut exec = ProcessExecutor::configure(cfg, limits)?.with_isolation(isolation(&ctx.host));
    exec.bind_task_dir(&ctx.task_name, &exec_ctx.alloc_dir)?;
    exec.start()?;

    let exec: Arc<dyn Executor> = Arc::new(exec);
    match TaskHandle::spawn(Arc::clone(&exec), ctx.span.clone()) {
        Ok(handle) => {
            info!(parent: &ctx.span, id = handle.id(), alloc = %exec_ctx.alloc_id, "task started");
            Ok(handle)
        }
        Err(e) => {
            let _ = exec.force_stop().await;
            Err(e)
        }
    }
}

pub(crate) fn reattach(ctx: &DriverContext, id: &str) -> Result<TaskHandle, DriverError> {
    let exec = ProcessExecutor::locate(id)?;
    let handle = TaskHandle::spawn(Arc::new(exec), ctx.span.clone())?;
    info!(parent: &ctx.span, id, "task re-attached");
    Ok(handle)
}
