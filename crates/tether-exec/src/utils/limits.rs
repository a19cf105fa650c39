//! Resource limits for spawned task processes.
//!
//! ## Overview
//!
//! Limits are applied inside a `pre_exec` hook, executed in the child process after
//! `fork()` and immediately before `execve()`. The task therefore never runs a single
//! instruction without its restrictions, no matter how quickly it exits.
//!
//! - `RLIMIT_AS` caps memory when no cgroup is used.
//! - `RLIMIT_FSIZE` caps the size of files the task writes (disk request).
//! - With cgroup isolation the child first writes itself into the prepared cgroup's
//!   `cgroup.procs`, so CPU weight and `memory.max` are in force before `execve`.
//!
//! Everything that can be checked in the parent is checked before spawn: the
//! `cgroup.procs` file is opened there and handed to the child as an fd, and requested
//! rlimits are compared with the agent's hard limits. A failure inside the hook only
//! reaches the parent as an errno, indistinguishable from a failed `execve`.
use std::{fs::File, io, os::fd::AsRawFd};

use tether_model::Resources;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExecError, ExecResult};

const MIB: u64 = 1024 * 1024;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_env = "gnu"))] {
        type RlimitResource = libc::__rlimit_resource_t;
    } else {
        type RlimitResource = libc::c_int;
    }
}

/// Limits requested for one task process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Relative CPU weight (shares).
    pub cpu_shares: u32,
    /// Memory ceiling in MB.
    pub memory_mb: u64,
    /// Maximum file size in MB; `0` means no limit.
    pub disk_mb: u64,
}

impl ResourceLimits {
    /// Rejects limits that cannot describe a runnable task.
    pub fn validate(&self) -> ExecResult<()> {
        if self.cpu_shares == 0 {
            return Err(ExecError::InvalidLimits("cpu shares must be positive".into()));
        }
        if self.memory_mb == 0 {
            return Err(ExecError::InvalidLimits("memory must be positive".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(MIB)
    }

    #[inline]
    pub fn disk_bytes(&self) -> Option<u64> {
        (self.disk_mb > 0).then(|| self.disk_mb.saturating_mul(MIB))
    }
}

impl From<&Resources> for ResourceLimits {
    fn from(r: &Resources) -> Self {
        Self {
            cpu_shares: r.cpu,
            memory_mb: r.memory_mb,
            disk_mb: r.disk_mb,
        }
    }
}

/// Declarative rlimit set for a child process.
///
/// `None` means "no explicit limit" for that resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlimitConfig {
    /// Address space size in bytes (`RLIMIT_AS`).
    pub max_address_space_bytes: Option<u64>,

    /// Maximum size of created files in bytes (`RLIMIT_FSIZE`).
    ///
    /// Growing a file beyond this makes the kernel deliver `SIGXFSZ`.
    pub max_file_size_bytes: Option<u64>,

    /// Disable core dumps (`RLIMIT_CORE = 0`).
    pub disable_core_dumps: bool,
}

impl RlimitConfig {
    /// Rlimits for `limits`. Memory is left to the cgroup when one is used.
    pub fn for_limits(limits: Option<&ResourceLimits>, cgroup: bool) -> Self {
        let Some(limits) = limits else {
            return Self::default();
        };
        if !cgroup {
            debug!(
                target: "tether.exec.limits",
                cpu_shares = limits.cpu_shares,
                "cpu shares are only enforced with cgroup isolation"
            );
        }
        Self {
            max_address_space_bytes: (!cgroup).then(|| limits.memory_bytes()),
            max_file_size_bytes: limits.disk_bytes(),
            disable_core_dumps: true,
        }
    }

    /// Fail with [`ExecError::Limits`] when the child could not lower itself to these
    /// limits, i.e. a value lies above the agent's hard limit and the agent cannot raise it.
    pub fn check(&self) -> ExecResult<()> {
        let privileged = unsafe { libc::geteuid() } == 0;
        let wanted = [
            ("RLIMIT_AS", libc::RLIMIT_AS, self.max_address_space_bytes),
            ("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, self.max_file_size_bytes),
        ];
        for (name, resource, value) in wanted {
            let Some(value) = value else { continue };
            let hard = hard_limit(resource)
                .map_err(|e| ExecError::Limits(format!("getrlimit {name}: {e}")))?;
            if !within_hard_limit(value, hard, privileged) {
                return Err(ExecError::Limits(format!(
                    "{name} of {value} bytes exceeds the hard limit of {} bytes",
                    hard.unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_address_space_bytes.is_none()
            && self.max_file_size_bytes.is_none()
            && !self.disable_core_dumps
    }
}

/// Install a single `pre_exec` hook joining `cgroup_procs` (if any) and applying `rlimits`.
///
/// `cgroup_procs` is an open `cgroup.procs` file; the child writes `0` to it, which moves
/// the writing process itself. The file is close-on-exec, so the task never sees it, and
/// it is closed in the parent when `cmd` is dropped.
pub fn attach_limits(cmd: &mut Command, rlimits: &RlimitConfig, cgroup_procs: Option<File>) {
    if rlimits.is_empty() && cgroup_procs.is_none() {
        return;
    }

    let rlimits = rlimits.clone();

    // SAFETY: the hook only performs async-signal-safe libc calls on data prepared
    // before fork; it allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(procs) = &cgroup_procs {
                join_cgroup(procs)?;
            }
            if let Some(bytes) = rlimits.max_address_space_bytes {
                apply_rlimit(libc::RLIMIT_AS, bytes)?;
            }
            if let Some(bytes) = rlimits.max_file_size_bytes {
                apply_rlimit(libc::RLIMIT_FSIZE, bytes)?;
            }
            if rlimits.disable_core_dumps {
                apply_rlimit(libc::RLIMIT_CORE, 0)?;
            }
            Ok(())
        });
    }
}

fn join_cgroup(procs: &File) -> io::Result<()> {
    let buf = b"0";
    let written = unsafe { libc::write(procs.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if written < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Hard limit of `resource`; `None` when unlimited.
fn hard_limit(resource: RlimitResource) -> io::Result<Option<u64>> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((rlim.rlim_max != libc::RLIM_INFINITY).then_some(rlim.rlim_max as u64))
}

fn within_hard_limit(value: u64, hard: Option<u64>, privileged: bool) -> bool {
    privileged || hard.is_none_or(|hard| value <= hard)
}

fn apply_rlimit(resource: RlimitResource, value: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };

    let rc = unsafe { libc::setrlimit(resource, &rlim) };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_cpu_or_memory_is_invalid() {
        let ok = ResourceLimits {
            cpu_shares: 250,
            memory_mb: 256,
            disk_mb: 0,
        };
        assert!(ok.validate().is_ok());

        let no_cpu = ResourceLimits { cpu_shares: 0, ..ok };
        assert!(matches!(no_cpu.validate(), Err(ExecError::InvalidLimits(_))));

        let no_mem = ResourceLimits { memory_mb: 0, ..ok };
        assert!(matches!(no_mem.validate(), Err(ExecError::InvalidLimits(_))));
    }

    #[test]
    fn no_limits_means_empty_rlimits() {
        let cfg = RlimitConfig::for_limits(None, false);
        assert!(cfg.is_empty());

        let mut cmd = Command::new("sh");
        attach_limits(&mut cmd, &cfg, None);
    }

    #[test]
    fn memory_goes_to_cgroup_when_available() {
        let limits = ResourceLimits {
            cpu_shares: 100,
            memory_mb: 64,
            disk_mb: 10,
        };

        let plain = RlimitConfig::for_limits(Some(&limits), false);
        assert_eq!(plain.max_address_space_bytes, Some(64 * MIB));
        assert_eq!(plain.max_file_size_bytes, Some(10 * MIB));

        let cgroup = RlimitConfig::for_limits(Some(&limits), true);
        assert_eq!(cgroup.max_address_space_bytes, None);
        assert_eq!(cgroup.max_file_size_bytes, Some(10 * MIB));
    }

    #[test]
    fn values_above_the_hard_limit_need_privileges() {
        assert!(within_hard_limit(64 * MIB, None, false));
        assert!(within_hard_limit(64 * MIB, Some(64 * MIB), false));
        assert!(!within_hard_limit(65 * MIB, Some(64 * MIB), false));
        assert!(within_hard_limit(65 * MIB, Some(64 * MIB), true));
    }

    #[test]
    fn modest_limits_pass_the_check() {
        let limits = ResourceLimits {
            cpu_shares: 100,
            memory_mb: 64,
            disk_mb: 1,
        };
        assert_eq!(RlimitConfig::for_limits(Some(&limits), false).check(), Ok(()));
        assert_eq!(RlimitConfig::default().check(), Ok(()));
    }
}
