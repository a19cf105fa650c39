use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};

/// Whether the process behind an identity still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exited but not yet reaped by its parent.
    Zombie,
    /// No such process, or the pid now belongs to a different process.
    Gone,
}

/// Stable reference to one OS process.
///
/// The pid alone is not enough after an agent restart: pids are recycled. The start
/// time (in clock ticks since boot) disambiguates, so a reused pid never resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIdentity {
    pub pid: i32,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<PathBuf>,
}

impl ProcessIdentity {
    /// Record the identity of a live `pid`.
    pub fn capture(pid: i32, cgroup: Option<PathBuf>) -> ExecResult<Self> {
        let (_, start_time) =
            read_stat(pid).ok_or_else(|| ExecError::NotFound(format!("pid {pid}")))?;
        Ok(Self {
            pid,
            start_time,
            cgroup,
        })
    }

    pub fn encode(&self) -> ExecResult<String> {
        serde_json::to_string(self).map_err(|e| ExecError::InvalidId(e.to_string()))
    }

    pub fn decode(id: &str) -> ExecResult<Self> {
        let ident: Self =
            serde_json::from_str(id).map_err(|e| ExecError::InvalidId(format!("{id:?}: {e}")))?;
        if ident.pid <= 0 {
            return Err(ExecError::InvalidId(format!("pid {} out of range", ident.pid)));
        }
        Ok(ident)
    }

    pub fn probe(&self) -> Liveness {
        match read_stat(self.pid) {
            Some((_, start)) if start != self.start_time => Liveness::Gone,
            Some(('Z' | 'X', _)) => Liveness::Zombie,
            Some(_) => Liveness::Running,
            None => Liveness::Gone,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn read_stat(pid: i32) -> Option<(char, u64)> {
            let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
            parse_stat(&raw)
        }
    } else {
        // Without procfs there is no start time to compare; liveness comes from kill(0).
        fn read_stat(pid: i32) -> Option<(char, u64)> {
            use nix::{sys::signal::kill, unistd::Pid};
            kill(Pid::from_raw(pid), None).ok().map(|()| ('R', 0))
        }
    }
}

/// State and start time from a `/proc/<pid>/stat` line.
///
/// The command name (field 2) may contain spaces and parentheses, so fields are
/// counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_stat(raw: &str) -> Option<(char, u64)> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // starttime is field 22; state was field 3.
    let start = fields.nth(22 - 4)?.parse().ok()?;
    Some((state, start))
}
