use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("missing program")]
    MissingProgram,
    #[error("invalid resource limits: {0}")]
    InvalidLimits(String),
    #[error("task directory for '{0}' not found")]
    TaskDirMissing(String),
    #[error("failed to apply resource limits: {0}")]
    Limits(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("executor already started")]
    AlreadyStarted,
    #[error("executor not started")]
    NotStarted,
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("invalid executor id: {0}")]
    InvalidId(String),
    #[error("failed to signal process: {0}")]
    Signal(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type ExecResult<T> = Result<T, ExecError>;

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}
