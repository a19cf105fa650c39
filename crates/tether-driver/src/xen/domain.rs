use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_exec::{ExecError, ExecResult, Executor};
use tether_model::WaitResult;
use tracing::{debug, warn};

use crate::{
    error::DriverError,
    xen::cli::{Hypervisor, HypervisorError},
};

/// Interval between domain registry reads.
pub const DOMAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive failed reads after which a domain is considered lost.
pub const MAX_PROBE_FAILURES: u32 = 12;

impl From<HypervisorError> for ExecError {
    fn from(e: HypervisorError) -> Self {
        ExecError::Backend(e.to_string())
    }
}

/// What the agent records about a running domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    pub domain: String,
    pub alloc_id: String,
    pub task: String,
    pub config_path: PathBuf,
}

/// Store for instance metadata, keyed by domain name.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put(&self, meta: &InstanceMetadata) -> Result<(), DriverError>;
    async fn remove(&self, domain: &str) -> Result<(), DriverError>;
}

/// In-process [`MetadataStore`].
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<BTreeMap<String, InstanceMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<InstanceMetadata> {
        self.entries.lock().get(domain).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, meta: &InstanceMetadata) -> Result<(), DriverError> {
        self.entries.lock().insert(meta.domain.clone(), meta.clone());
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<(), DriverError> {
        self.entries.lock().remove(domain);
        Ok(())
    }
}

/// Executor for one hypervisor domain. Its identifier is the domain name.
///
/// There is no child to wait on, so `wait` polls the domain registry. A failed read
/// keeps the last known state; after [`MAX_PROBE_FAILURES`] consecutive failures the
/// domain is reported as lost.
pub struct DomainExecutor {
    domain: String,
    hv: Arc<dyn Hypervisor>,
    meta: Arc<dyn MetadataStore>,
    poll_interval: Duration,
    waited: AtomicBool,
}

impl DomainExecutor {
    pub fn new(
        domain: impl Into<String>,
        hv: Arc<dyn Hypervisor>,
        meta: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            domain: domain.into(),
            hv,
            meta,
            poll_interval: DOMAIN_POLL_INTERVAL,
            waited: AtomicBool::new(false),
        }
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    async fn poll_until_gone(&self) -> WaitResult {
        let mut failures = 0u32;
        loop {
            match self.hv.is_running(&self.domain).await {
                Ok(true) => failures = 0,
                Ok(false) => {
                    debug!(target: "tether.driver.xen", domain = %self.domain, "domain is gone");
                    return WaitResult::exited(0);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        target: "tether.driver.xen",
                        domain = %self.domain,
                        failures,
                        error = %e,
                        "domain probe failed"
                    );
                    if failures >= MAX_PROBE_FAILURES {
                        return WaitResult::failed(format!(
                            "lost track of domain after {failures} failed probes: {e}"
                        ));
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Executor for DomainExecutor {
    fn id(&self) -> ExecResult<String> {
        Ok(self.domain.clone())
    }

    async fn wait(&self) -> WaitResult {
        if self.waited.swap(true, Ordering::SeqCst) {
            return WaitResult::failed("wait already called");
        }
        let res = self.poll_until_gone().await;
        if let Err(e) = self.meta.remove(&self.domain).await {
            warn!(
                target: "tether.driver.xen",
                domain = %self.domain,
                error = %e,
                "failed to drop instance metadata"
            );
        }
        res
    }

    async fn shutdown(&self) -> ExecResult<()> {
        self.hv.shutdown(&self.domain).await.map_err(Into::into)
    }

    async fn force_stop(&self) -> ExecResult<()> {
        self.hv
            .destroy(&self.domain)
            .await
            .map_err(|e| ExecError::Signal(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Scripted hypervisor: `is_running` pops answers, then reports the last one forever.
    #[derive(Default)]
    pub(crate) struct FakeHypervisor {
        pub info: String,
        pub answers: Mutex<VecDeque<Result<bool, HypervisorError>>>,
        pub created: Mutex<Vec<PathBuf>>,
        pub destroyed: AtomicBool,
    }

    impl FakeHypervisor {
        pub(crate) fn answering<I>(answers: I) -> Self
        where
            I: IntoIterator<Item = Result<bool, HypervisorError>>,
        {
            Self {
                answers: Mutex::new(answers.into_iter().collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn info(&self) -> Result<String, HypervisorError> {
            Ok(self.info.clone())
        }

        async fn create(&self, config: &std::path::Path) -> Result<(), HypervisorError> {
            self.created.lock().push(config.to_path_buf());
            Ok(())
        }

        async fn is_running(&self, _domain: &str) -> Result<bool, HypervisorError> {
            if self.destroyed.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let mut answers = self.answers.lock();
            match answers.len() {
                0 => Ok(true),
                1 => answers[0].clone(),
                _ => answers.pop_front().unwrap_or(Ok(true)),
            }
        }

        async fn shutdown(&self, _domain: &str) -> Result<(), HypervisorError> {
            Ok(())
        }

        async fn destroy(&self, _domain: &str) -> Result<(), HypervisorError> {
            self.destroyed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn probe_error() -> HypervisorError {
        HypervisorError::Command {
            cmd: "list web-a1".into(),
            stderr: "libxl: cannot connect".into(),
        }
    }

    fn executor(hv: FakeHypervisor, meta: Arc<MemoryMetadataStore>) -> DomainExecutor {
        DomainExecutor::new("web-a1", Arc::new(hv), meta)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_probe_failures_are_tolerated() {
        let meta = Arc::new(MemoryMetadataStore::new());
        meta.put(&InstanceMetadata {
            domain: "web-a1".into(),
            alloc_id: "a1".into(),
            task: "web".into(),
            config_path: "/tmp/web.cfg".into(),
        })
        .await
        .unwrap();

        let hv = FakeHypervisor::answering([
            Ok(true),
            Err(probe_error()),
            Err(probe_error()),
            Ok(true),
            Ok(false),
        ]);
        let exec = executor(hv, meta.clone());

        assert_eq!(exec.wait().await, WaitResult::exited(0));
        assert!(meta.is_empty());
        assert!(exec.wait().await.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_probe_failures_converge() {
        let hv = FakeHypervisor::answering([Err(probe_error())]);
        let exec = executor(hv, Arc::new(MemoryMetadataStore::new()));

        let started = tokio::time::Instant::now();
        let res = exec.wait().await;
        assert_eq!(res.exit_code, -1);
        assert!(res.error.unwrap().contains("12 failed probes"));
        assert_eq!(
            started.elapsed(),
            DOMAIN_POLL_INTERVAL * (MAX_PROBE_FAILURES - 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn force_stop_destroys_the_domain() {
        let exec = Arc::new(executor(
            FakeHypervisor::default(),
            Arc::new(MemoryMetadataStore::new()),
        ));
        assert_eq!(exec.id().unwrap(), "web-a1");

        let waiter = tokio::spawn({
            let exec = Arc::clone(&exec);
            async move { exec.wait().await }
        });
        exec.force_stop().await.unwrap();
        assert_eq!(waiter.await.unwrap(), WaitResult::exited(0));
    }
}
