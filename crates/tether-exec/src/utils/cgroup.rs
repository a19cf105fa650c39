//! Per-task cgroup v2 directories.
//!
//! A cgroup is prepared before spawn (`cpu.weight`, `memory.max`, an open
//! `cgroup.procs`) and joined by the child from its `pre_exec` hook. It is removed once
//! the task has been waited on.
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    error::{ExecError, ExecResult},
    utils::limits::ResourceLimits,
};

const MIN_SHARES: u32 = 2;
const MAX_SHARES: u32 = 262_144;
const MIN_WEIGHT: u64 = 1;
const MAX_WEIGHT: u64 = 10_000;

/// Map cgroup v1 style CPU shares onto the v2 `cpu.weight` range `[1, 10000]`.
pub fn shares_to_weight(shares: u32) -> u64 {
    let shares = u64::from(shares.clamp(MIN_SHARES, MAX_SHARES));
    let span = u64::from(MAX_SHARES - MIN_SHARES);
    MIN_WEIGHT + ((shares - u64::from(MIN_SHARES)) * (MAX_WEIGHT - MIN_WEIGHT)) / span
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create `<root>/<name>` and write the controller files for `limits`.
    ///
    /// The directory is removed again when writing a controller file fails.
    pub fn create(root: &Path, name: &str, limits: Option<&ResourceLimits>) -> ExecResult<Self> {
        let path = root.join(name);
        fs::create_dir(&path)
            .map_err(|e| ExecError::Limits(format!("create cgroup {}: {e}", path.display())))?;
        let cgroup = Self { path };

        if let Some(limits) = limits {
            if let Err(e) = cgroup.write_limits(limits) {
                let _ = cgroup.remove();
                return Err(e);
            }
        }

        debug!(target: "tether.exec.cgroup", path = %cgroup.path.display(), "cgroup created");
        Ok(cgroup)
    }

    /// Handle to an existing cgroup, e.g. one recorded in an executor identifier.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open `cgroup.procs` for writing. The file is never created: a directory that is
    /// not part of a cgroup v2 hierarchy has none, and that is reported here, before spawn.
    pub fn open_procs(&self) -> ExecResult<File> {
        let procs = self.path.join("cgroup.procs");
        OpenOptions::new()
            .write(true)
            .open(&procs)
            .map_err(|e| ExecError::Limits(format!("open {}: {e}", procs.display())))
    }

    /// Kill every process in the cgroup. A cgroup that is already gone counts as killed.
    pub fn kill(&self) -> ExecResult<()> {
        match fs::write(self.path.join("cgroup.kill"), "1") {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecError::Signal(format!(
                "cgroup.kill {}: {e}",
                self.path.display()
            ))),
        }
    }

    pub fn remove(&self) -> ExecResult<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(
                    target: "tether.exec.cgroup",
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove cgroup"
                );
                Err(e.into())
            }
        }
    }

    fn write_limits(&self, limits: &ResourceLimits) -> ExecResult<()> {
        self.write("cpu.weight", &shares_to_weight(limits.cpu_shares).to_string())?;
        self.write("memory.max", &limits.memory_bytes().to_string())
    }

    fn write(&self, file: &str, value: &str) -> ExecResult<()> {
        fs::write(self.path.join(file), value)
            .map_err(|e| ExecError::Limits(format!("write {file}={value}: {e}")))
    }
}
