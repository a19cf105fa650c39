pub mod cgroup;
pub mod limits;
pub(crate) mod signal;
