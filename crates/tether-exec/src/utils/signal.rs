use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};

use crate::error::{ExecError, ExecResult};

/// Deliver `sig` to the process group led by `pid`.
///
/// Executors spawn every task as its own group leader, so helpers forked by the task
/// are reached too. A group that no longer exists counts as delivered.
pub(crate) fn signal_group(pid: i32, sig: Signal) -> ExecResult<()> {
    match killpg(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ExecError::Signal(format!("{sig} to pid {pid}: {e}"))),
    }
}
