//! Resource-constrained process executor.
//!
//! A [`ProcessExecutor`] wraps exactly one OS process: it applies CPU/memory/disk limits
//! atomically with `execve`, confines the working directory to the task directory and
//! exposes an identifier that lets a restarted agent find the process again.
//!
//! The crate targets Unix hosts; cgroup isolation additionally requires Linux with a
//! writable cgroup v2 hierarchy.

mod error;
pub use error::{ExecError, ExecResult};

mod executor;
pub use executor::Executor;

pub mod proc;
pub use proc::{Isolation, ProcConfig, ProcessExecutor};

pub mod utils;
pub use utils::limits::ResourceLimits;

pub mod prelude {
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::executor::Executor;
    pub use crate::proc::{Isolation, ProcConfig, ProcessExecutor};
    pub use crate::utils::limits::ResourceLimits;
}
