use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{SHARED_ALLOC_DIR, TASK_LOCAL_DIR};

/// Directory tree of one allocation.
///
/// ```text
/// <root>/
///   alloc/            shared between tasks
///   <task>/local/     task-private, artifacts land here
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocDir {
    pub root: PathBuf,
    pub shared_dir: PathBuf,
    /// Task name → task directory. Only tasks that were built are present.
    pub task_dirs: BTreeMap<String, PathBuf>,
}

impl AllocDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            shared_dir: root.join(SHARED_ALLOC_DIR),
            root,
            task_dirs: BTreeMap::new(),
        }
    }

    /// Create the shared dir and a `local/` subtree for every task.
    pub fn build<S: AsRef<str>>(&mut self, tasks: &[S]) -> io::Result<()> {
        fs::create_dir_all(&self.shared_dir)?;
        for task in tasks {
            let task = task.as_ref();
            let dir = self.root.join(task);
            fs::create_dir_all(dir.join(TASK_LOCAL_DIR))?;
            self.task_dirs.insert(task.to_string(), dir);
        }
        Ok(())
    }

    pub fn task_dir(&self, task: &str) -> Option<&Path> {
        self.task_dirs.get(task).map(PathBuf::as_path)
    }

    pub fn task_local_dir(&self, task: &str) -> Option<PathBuf> {
        self.task_dir(task).map(|d| d.join(TASK_LOCAL_DIR))
    }
}
