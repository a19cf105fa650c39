use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Default upper bound for a single fingerprint probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Option key: cgroup v2 directory under which exec/java tasks get their own cgroup.
pub const OPT_EXEC_CGROUP_ROOT: &str = "driver.exec.cgroup_root";
/// Option key: java binary used for probing and launching.
pub const OPT_JAVA_PATH: &str = "driver.java.path";
/// Option key: `xl` binary.
pub const OPT_XEN_PATH: &str = "driver.xen.path";

/// Node-level configuration shared by every driver on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub state_dir: PathBuf,
    pub alloc_dir: PathBuf,
    pub probe_timeout_ms: u64,
    /// Free-form driver options (`driver.<name>.<option>`).
    pub options: BTreeMap<String, String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            state_dir: tmp.clone(),
            alloc_dir: tmp,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            options: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    pub fn from_json(raw: &str) -> Result<Self, DriverError> {
        serde_json::from_str(raw).map_err(|e| DriverError::Config(format!("host config: {e}")))
    }

    #[inline]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn with_dirs(
        mut self,
        state_dir: impl Into<PathBuf>,
        alloc_dir: impl Into<PathBuf>,
    ) -> Self {
        self.state_dir = state_dir.into();
        self.alloc_dir = alloc_dir.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}
