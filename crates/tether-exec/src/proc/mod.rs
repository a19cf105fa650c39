use std::{
    fs::File,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use parking_lot::Mutex;
use tether_model::{AllocDir, TaskEnv, WaitResult};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{ExecError, ExecResult},
    executor::Executor,
    utils::{
        cgroup::Cgroup,
        limits::{ResourceLimits, RlimitConfig, attach_limits},
        signal::signal_group,
    },
};

mod identity;
pub use identity::{Liveness, ProcessIdentity};

/// How often a located executor checks on a process it did not spawn.
pub const REATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Command line and environment of a task process.
#[derive(Clone, Debug, Default)]
pub struct ProcConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Exact environment of the child. `PATH` is inherited from the agent when absent.
    pub env: TaskEnv,
}

impl ProcConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: TaskEnv) -> Self {
        self.env = env;
        self
    }
}

/// How resource limits are enforced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Isolation {
    /// `setrlimit` only; CPU shares are not enforced.
    #[default]
    Rlimit,
    /// A per-task cgroup v2 under `root`.
    Cgroup { root: PathBuf },
}

impl Isolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::Rlimit => "rlimit",
            Isolation::Cgroup { .. } => "cgroup",
        }
    }
}

#[derive(Debug)]
struct TaskBinding {
    name: String,
    dir: PathBuf,
}

enum State {
    Configured,
    Running(Child),
    Located,
    Waited,
}

/// Executor for exactly one OS process.
///
/// Obtained either with [`ProcessExecutor::configure`] + [`ProcessExecutor::start`] or
/// with [`ProcessExecutor::locate`] for a process started by an earlier agent run.
/// Signals are addressed to the process group, so `shutdown` and `force_stop` never
/// contend with a pending `wait`.
pub struct ProcessExecutor {
    cfg: ProcConfig,
    limits: Option<ResourceLimits>,
    isolation: Isolation,
    poll_interval: Duration,
    task: Option<TaskBinding>,
    state: Mutex<State>,
    identity: Mutex<Option<ProcessIdentity>>,
    cgroup: Mutex<Option<Cgroup>>,
}

impl ProcessExecutor {
    /// Prepare an executor; nothing is spawned yet.
    pub fn configure(cfg: ProcConfig, limits: Option<ResourceLimits>) -> ExecResult<Self> {
        if cfg.program.trim().is_empty() {
            return Err(ExecError::MissingProgram);
        }
        if let Some(limits) = &limits {
            limits.validate()?;
        }
        Ok(Self::with_state(cfg, limits, State::Configured))
    }

    /// Find a process recorded by [`Executor::id`].
    ///
    /// Fails with [`ExecError::NotFound`] when the pid is gone, has exited, or now
    /// belongs to a different process.
    pub fn locate(id: &str) -> ExecResult<Self> {
        let ident = ProcessIdentity::decode(id)?;
        match ident.probe() {
            Liveness::Running => {}
            other => {
                debug!(target: "tether.exec", pid = ident.pid, ?other, "locate failed");
                return Err(ExecError::NotFound(format!("pid {}", ident.pid)));
            }
        }

        let exec = Self::with_state(ProcConfig::default(), None, State::Located);
        *exec.cgroup.lock() = ident.cgroup.clone().map(Cgroup::open);
        info!(target: "tether.exec", pid = ident.pid, "located process");
        *exec.identity.lock() = Some(ident);
        Ok(exec)
    }

    fn with_state(cfg: ProcConfig, limits: Option<ResourceLimits>, state: State) -> Self {
        Self {
            cfg,
            limits,
            isolation: Isolation::default(),
            poll_interval: REATTACH_POLL_INTERVAL,
            task: None,
            state: Mutex::new(state),
            identity: Mutex::new(None),
            cgroup: Mutex::new(None),
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    /// Run inside `<task_dir>` and send output to `<task_dir>/<task>.stdout|stderr`.
    pub fn bind_task_dir(&mut self, task: &str, alloc: &AllocDir) -> ExecResult<()> {
        let dir = alloc
            .task_dir(task)
            .filter(|d| d.is_dir())
            .ok_or_else(|| ExecError::TaskDirMissing(task.to_string()))?;
        self.task = Some(TaskBinding {
            name: task.to_string(),
            dir: dir.to_path_buf(),
        });
        Ok(())
    }

    pub fn pid(&self) -> Option<i32> {
        self.identity.lock().as_ref().map(|i| i.pid)
    }

    /// Spawn the process with limits attached before `execve`.
    pub fn start(&self) -> ExecResult<()> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Configured) {
            return Err(ExecError::AlreadyStarted);
        }

        let cgroup = self.prepare_cgroup()?;
        let mut cmd = match self.build_command(cgroup.as_ref()) {
            Ok(cmd) => cmd,
            Err(e) => {
                if let Some(cg) = &cgroup {
                    let _ = cg.remove();
                }
                return Err(e);
            }
        };

        trace!(target: "tether.exec", program = %self.cfg.program, args = ?self.cfg.args, "spawn");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(cg) = &cgroup {
                    let _ = cg.remove();
                }
                return Err(ExecError::Spawn(format!("{}: {e}", self.cfg.program)));
            }
        };

        let ident = child
            .id()
            .ok_or_else(|| ExecError::Spawn("child exited before its pid was read".into()))
            .and_then(|pid| {
                let cgroup_path = cgroup.as_ref().map(|c| c.path().to_path_buf());
                ProcessIdentity::capture(pid as i32, cgroup_path)
            });
        let ident = match ident {
            Ok(ident) => ident,
            Err(e) => {
                let mut child = child;
                let _ = child.start_kill();
                return Err(e);
            }
        };

        info!(
            target: "tether.exec",
            pid = ident.pid,
            program = %self.cfg.program,
            isolation = self.isolation.as_str(),
            "process started"
        );
        *self.identity.lock() = Some(ident);
        *self.cgroup.lock() = cgroup;
        *state = State::Running(child);
        Ok(())
    }

    fn prepare_cgroup(&self) -> ExecResult<Option<Cgroup>> {
        let Isolation::Cgroup { root } = &self.isolation else {
            return Ok(None);
        };
        let task = self.task.as_ref().map_or("task", |t| t.name.as_str());
        let name = format!("tether-{task}-{}", uuid::Uuid::new_v4().simple());
        Cgroup::create(root, &name, self.limits.as_ref()).map(Some)
    }

    fn build_command(&self, cgroup: Option<&Cgroup>) -> ExecResult<Command> {
        let rlimits = RlimitConfig::for_limits(self.limits.as_ref(), cgroup.is_some());
        rlimits.check()?;
        let procs = cgroup.map(Cgroup::open_procs).transpose()?;

        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args);

        cmd.env_clear();
        for kv in self.cfg.env.iter() {
            cmd.env(kv.key(), kv.value());
        }
        if self.cfg.env.get("PATH").is_none() {
            if let Some(path) = std::env::var_os("PATH") {
                cmd.env("PATH", path);
            }
        }

        cmd.stdin(Stdio::null());
        match &self.task {
            Some(task) => {
                cmd.current_dir(&task.dir);
                let stdout = File::create(task.dir.join(format!("{}.stdout", task.name)))?;
                let stderr = File::create(task.dir.join(format!("{}.stderr", task.name)))?;
                cmd.stdout(stdout).stderr(stderr);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        cmd.process_group(0);
        cmd.kill_on_drop(false);

        attach_limits(&mut cmd, &rlimits, procs);
        Ok(cmd)
    }

    fn identity(&self) -> Option<ProcessIdentity> {
        self.identity.lock().clone()
    }

    /// Identity of a process that can still be signalled.
    fn running(&self) -> ExecResult<Option<ProcessIdentity>> {
        let ident = self.identity().ok_or(ExecError::NotStarted)?;
        Ok((ident.probe() == Liveness::Running).then_some(ident))
    }

    fn release_cgroup(&self) {
        if let Some(cg) = self.cgroup.lock().take() {
            let _ = cg.remove();
        }
    }

    async fn wait_located(&self, ident: ProcessIdentity) -> WaitResult {
        let pid = Pid::from_raw(ident.pid);
        loop {
            let liveness = ident.probe();
            if liveness == Liveness::Gone {
                return WaitResult::failed("process exited while detached; exit status unavailable");
            }

            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => return WaitResult::exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return WaitResult::signaled(sig as i32),
                Ok(_) => {}
                // Not our child: only liveness is observable.
                Err(Errno::ECHILD) if liveness == Liveness::Zombie => {
                    return WaitResult::failed(
                        "process exited while detached; exit status unavailable",
                    );
                }
                Err(Errno::ECHILD) => {}
                Err(e) => return WaitResult::failed(format!("waitpid {}: {e}", ident.pid)),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn id(&self) -> ExecResult<String> {
        self.identity().ok_or(ExecError::NotStarted)?.encode()
    }

    async fn wait(&self) -> WaitResult {
        let prev = std::mem::replace(&mut *self.state.lock(), State::Waited);
        let res = match prev {
            State::Running(mut child) => match child.wait().await {
                Ok(status) => from_status(status),
                Err(e) => WaitResult::failed(format!("wait: {e}")),
            },
            State::Located => match self.identity() {
                Some(ident) => self.wait_located(ident).await,
                None => WaitResult::failed("located executor without identity"),
            },
            State::Configured => {
                *self.state.lock() = State::Configured;
                return WaitResult::failed("executor not started");
            }
            State::Waited => return WaitResult::failed("wait already called"),
        };

        self.release_cgroup();
        debug!(target: "tether.exec", pid = ?self.pid(), result = %res, "process exited");
        res
    }

    async fn shutdown(&self) -> ExecResult<()> {
        let Some(ident) = self.running()? else {
            return Ok(());
        };
        debug!(target: "tether.exec", pid = ident.pid, "SIGTERM");
        signal_group(ident.pid, Signal::SIGTERM)
    }

    async fn force_stop(&self) -> ExecResult<()> {
        let Some(ident) = self.running()? else {
            return Ok(());
        };
        if let Some(cg) = self.cgroup.lock().as_ref() {
            if let Err(e) = cg.kill() {
                warn!(target: "tether.exec", pid = ident.pid, error = %e, "cgroup kill failed");
            }
        }
        debug!(target: "tether.exec", pid = ident.pid, "SIGKILL");
        signal_group(ident.pid, Signal::SIGKILL)
    }
}

fn from_status(status: ExitStatus) -> WaitResult {
    match (status.code(), status.signal()) {
        (Some(code), _) => WaitResult::exited(code),
        (None, Some(sig)) => WaitResult::signaled(sig),
        (None, None) => WaitResult::failed(format!("unrecognised exit status: {status}")),
    }
}
