//! Pluggable task drivers for a node agent.
//!
//! A [`Driver`] probes the host ([`Driver::fingerprint`]), launches tasks
//! ([`Driver::start`]) and re-attaches to tasks started by an earlier agent run
//! ([`Driver::open`]). Every launched task is tracked by a [`TaskHandle`], whose
//! background monitor publishes the task's [`WaitResult`](tether_model::WaitResult)
//! exactly once.
//!
//! Built-in drivers:
//! - `exec`: fork/exec under rlimits or a cgroup v2.
//! - `java`: `java -jar` on top of the exec machinery.
//! - `xen`: one hypervisor domain per task, driven through `xl`.

mod error;
pub use error::DriverError;

pub mod config;
pub use config::HostConfig;

mod context;
pub use context::{DriverContext, ExecContext};

mod driver;
pub use driver::Driver;

pub mod handle;
pub use handle::TaskHandle;

pub mod artifact;
pub mod env;
pub mod fingerprint;

pub mod exec;
pub mod java;
pub mod xen;

mod registry;
pub use registry::{DriverFactory, DriverRegistry};

pub mod prelude {
    pub use crate::artifact::{ArtifactFetcher, FsFetcher};
    pub use crate::config::HostConfig;
    pub use crate::context::{DriverContext, ExecContext};
    pub use crate::driver::Driver;
    pub use crate::error::DriverError;
    pub use crate::handle::TaskHandle;
    pub use crate::registry::DriverRegistry;
}
