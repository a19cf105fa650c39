mod kv;
pub use kv::KeyValue;

mod task_env;
pub use task_env::TaskEnv;

mod wait_result;
pub use wait_result::WaitResult;

mod node;
pub use node::NodeAttributes;

mod alloc_dir;
pub use alloc_dir::AllocDir;

mod constants;
pub use constants::{SHARED_ALLOC_DIR, TASK_LOCAL_DIR};

/// Allocation identifier assigned by the scheduler.
pub type AllocId = String;
