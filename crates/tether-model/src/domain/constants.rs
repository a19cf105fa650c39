//! Well-known directory names inside an allocation directory.

/// Name of the directory shared by every task of an allocation.
pub const SHARED_ALLOC_DIR: &str = "alloc";

/// Name of the task-private subdirectory artifacts are downloaded into.
///
/// Commands refer to fetched artifacts relative to the task directory, e.g. `local/app.jar`.
pub const TASK_LOCAL_DIR: &str = "local";
