//! Shared data model for task drivers.
//!
//! Everything here is plain data owned by the agent and handed to drivers read-only:
//! task specifications, resource requests, the node attribute map and the terminal
//! outcome of a task.

mod error;
pub use error::ModelError;

mod domain;
pub use domain::*;

mod task;
pub use task::*;
