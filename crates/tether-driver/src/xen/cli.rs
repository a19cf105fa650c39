use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::trace;

use crate::error::DriverError;

const DEFAULT_XL: &str = "xl";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("{0} is not runnable: {1}")]
    Unavailable(String, String),
    #[error("xl {cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },
    #[error("xl {0} timed out")]
    Timeout(String),
}

impl From<HypervisorError> for DriverError {
    fn from(e: HypervisorError) -> Self {
        DriverError::Launch(e.to_string())
    }
}

/// Control plane of a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Raw host information (`key : value` lines).
    async fn info(&self) -> Result<String, HypervisorError>;
    /// Define and boot a domain from a config file.
    async fn create(&self, config: &Path) -> Result<(), HypervisorError>;
    /// `false` once the domain no longer exists.
    async fn is_running(&self, domain: &str) -> Result<bool, HypervisorError>;
    /// Ask the guest to power off. A missing domain counts as done.
    async fn shutdown(&self, domain: &str) -> Result<(), HypervisorError>;
    /// Tear the domain down immediately. A missing domain counts as done.
    async fn destroy(&self, domain: &str) -> Result<(), HypervisorError>;
}

/// [`Hypervisor`] backed by the `xl` toolstack.
#[derive(Debug, Clone)]
pub struct XlCli {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for XlCli {
    fn default() -> Self {
        Self::new(DEFAULT_XL)
    }
}

impl XlCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let cmd_line = args.join(" ");
        trace!(
            target: "tether.driver.xen",
            binary = %self.binary.display(),
            args = %cmd_line,
            "xl"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        let out = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| HypervisorError::Timeout(cmd_line.clone()))?
            .map_err(|e| {
                HypervisorError::Unavailable(self.binary.display().to_string(), e.to_string())
            })?;

        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(HypervisorError::Command {
                cmd: cmd_line,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }

    /// Run a per-domain command, mapping "no such domain" to `Ok(false)`.
    async fn run_on_domain(&self, args: &[&str]) -> Result<bool, HypervisorError> {
        match self.run(args).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::Command { stderr, .. }) if is_missing_domain(&stderr) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("invalid domain identifier") || stderr.contains("domain does not exist")
}

#[async_trait]
impl Hypervisor for XlCli {
    async fn info(&self) -> Result<String, HypervisorError> {
        self.run(&["info"]).await
    }

    async fn create(&self, config: &Path) -> Result<(), HypervisorError> {
        let config = config.to_string_lossy();
        self.run(&["create", config.as_ref()]).await.map(|_| ())
    }

    async fn is_running(&self, domain: &str) -> Result<bool, HypervisorError> {
        self.run_on_domain(&["list", domain]).await
    }

    async fn shutdown(&self, domain: &str) -> Result<(), HypervisorError> {
        self.run_on_domain(&["shutdown", domain]).await.map(|_| ())
    }

    async fn destroy(&self, domain: &str) -> Result<(), HypervisorError> {
        self.run_on_domain(&["destroy", domain]).await.map(|_| ())
    }
}
