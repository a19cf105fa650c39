use tether_exec::ExecError;
use tether_model::ModelError;
use thiserror::Error;

/// Errors returned synchronously by drivers and handles.
///
/// A probe that finds its backend missing is not an error: `fingerprint` returns
/// `Ok(false)` instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("invalid driver config: {0}")]
    Config(String),
    #[error("driver misconfigured: {0}")]
    ProbeMisconfigured(String),
    #[error("resource limits rejected: {0}")]
    ResourceLimit(String),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("artifact: {0}")]
    Artifact(String),
    #[error("handle not found: {0}")]
    ReattachNotFound(String),
    #[error("termination failed: {0}")]
    Termination(String),
}

impl From<ModelError> for DriverError {
    fn from(e: ModelError) -> Self {
        DriverError::Config(e.to_string())
    }
}

impl From<ExecError> for DriverError {
    fn from(e: ExecError) -> Self {
        let msg = e.to_string();
        match e {
            ExecError::MissingProgram => DriverError::Config(msg),
            ExecError::InvalidLimits(_) | ExecError::Limits(_) => DriverError::ResourceLimit(msg),
            ExecError::NotFound(_) | ExecError::InvalidId(_) => DriverError::ReattachNotFound(msg),
            ExecError::Signal(_) => DriverError::Termination(msg),
            ExecError::TaskDirMissing(_)
            | ExecError::Spawn(_)
            | ExecError::AlreadyStarted
            | ExecError::NotStarted
            | ExecError::Backend(_)
            | ExecError::Io(_) => DriverError::Launch(msg),
        }
    }
}
