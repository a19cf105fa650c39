//! Xen driver: one hypervisor domain per task, driven through `xl`.
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use tether_exec::{ExecError, Executor};
use tether_model::{NodeAttributes, TaskSpec};
use tracing::{debug, info, warn};

use crate::{
    artifact::{ArtifactFetcher, FsFetcher},
    config::{HostConfig, OPT_XEN_PATH},
    context::{DriverContext, ExecContext},
    driver::Driver,
    error::DriverError,
    exec::fetch_artifact,
    fingerprint::publish_driver,
    handle::TaskHandle,
};

mod cli;
pub use cli::{Hypervisor, HypervisorError, XlCli};

mod domain;
pub use domain::{
    DOMAIN_POLL_INTERVAL, DomainExecutor, InstanceMetadata, MAX_PROBE_FAILURES,
    MemoryMetadataStore, MetadataStore,
};

pub const NAME: &str = "xen";

const DEFAULT_XL: &str = "xl";
const DEFAULT_VCPUS: u32 = 1;
const INFO_PATTERN: &str = r"^(\w+)\s+:\s+(.+)$";

pub struct XenDriver {
    ctx: DriverContext,
    hv: Arc<dyn Hypervisor>,
    meta: Arc<dyn MetadataStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    poll_interval: Duration,
}

impl XenDriver {
    pub fn new(ctx: DriverContext) -> Self {
        let xl = XlCli::new(ctx.host.option(OPT_XEN_PATH).unwrap_or(DEFAULT_XL));
        Self {
            ctx,
            hv: Arc::new(xl),
            meta: Arc::new(MemoryMetadataStore::new()),
            fetcher: Arc::new(FsFetcher),
            poll_interval: DOMAIN_POLL_INTERVAL,
        }
    }

    pub fn with_hypervisor(mut self, hv: Arc<dyn Hypervisor>) -> Self {
        self.hv = hv;
        self
    }

    pub fn with_metadata_store(mut self, meta: Arc<dyn MetadataStore>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    fn executor(&self, domain: &str) -> Arc<dyn Executor> {
        Arc::new(
            DomainExecutor::new(domain, Arc::clone(&self.hv), Arc::clone(&self.meta))
                .with_poll_interval(self.poll_interval),
        )
    }
}

#[async_trait]
impl Driver for XenDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fingerprint(
        &self,
        cfg: &HostConfig,
        node: &mut NodeAttributes,
    ) -> Result<bool, DriverError> {
        let out = match tokio::time::timeout(cfg.probe_timeout(), self.hv.info()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                debug!(parent: &self.ctx.span, error = %e, "xl info failed; xen disabled");
                return Ok(false);
            }
            Err(_) => {
                warn!(parent: &self.ctx.span, "xl info timed out; xen disabled");
                return Ok(false);
            }
        };

        let facts = parse_info(&out);
        if !facts.contains_key("xen_version") {
            return Err(DriverError::ProbeMisconfigured(
                "unable to determine xen version".into(),
            ));
        }
        publish_driver(node, NAME, facts);
        Ok(true)
    }

    async fn start(&self, ctx: &ExecContext, task: &TaskSpec) -> Result<TaskHandle, DriverError> {
        let base_image = task.config.require("base_image_path")?;
        let local = ctx
            .alloc_dir
            .task_local_dir(&self.ctx.task_name)
            .ok_or_else(|| ExecError::TaskDirMissing(self.ctx.task_name.clone()))?;

        fetch_artifact(&self.ctx, ctx, self.fetcher.as_ref(), &task.config, false).await?;
        let image = self.fetcher.fetch(base_image, None, &local).await?;

        let domain = format!("{}-{}", task.name, ctx.alloc_id);
        let spec = DomainSpec {
            name: &domain,
            memory_mb: task.resources.as_ref().map_or(0, |r| r.memory_mb),
            vcpus: task.config.parse("vcpus")?.unwrap_or(DEFAULT_VCPUS),
            kernel: task.config.get("kernel"),
            image: &image,
        };
        let cfg_path = local.join(format!("{domain}.cfg"));
        tokio::fs::write(&cfg_path, spec.render()?)
            .await
            .map_err(|e| DriverError::Launch(format!("write {}: {e}", cfg_path.display())))?;

        self.hv.create(&cfg_path).await?;

        let meta = InstanceMetadata {
            domain: domain.clone(),
            alloc_id: ctx.alloc_id.clone(),
            task: task.name.clone(),
            config_path: cfg_path,
        };
        if let Err(e) = self.meta.put(&meta).await {
            let _ = self.hv.destroy(&domain).await;
            return Err(e);
        }

        let handle = match TaskHandle::spawn(self.executor(&domain), self.ctx.span.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.hv.destroy(&domain).await;
                let _ = self.meta.remove(&domain).await;
                return Err(e);
            }
        };
        info!(parent: &self.ctx.span, %domain, "domain started");
        Ok(handle)
    }

    async fn open(&self, _ctx: &ExecContext, id: &str) -> Result<TaskHandle, DriverError> {
        if !self.hv.is_running(id).await? {
            return Err(DriverError::ReattachNotFound(format!("domain {id}")));
        }
        let handle = TaskHandle::spawn(self.executor(id), self.ctx.span.clone())?;
        info!(parent: &self.ctx.span, domain = id, "domain re-attached");
        Ok(handle)
    }
}

/// `key : value` lines of `xl info`.
pub fn parse_info(out: &str) -> BTreeMap<String, String> {
    let Ok(re) = Regex::new(INFO_PATTERN) else {
        return BTreeMap::new();
    };
    out.lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some((caps[1].to_string(), caps[2].trim().to_string()))
        })
        .collect()
}

/// Domain definition; limits are fixed here, at definition time.
struct DomainSpec<'a> {
    name: &'a str,
    memory_mb: u64,
    vcpus: u32,
    kernel: Option<&'a str>,
    image: &'a Path,
}

impl DomainSpec<'_> {
    /// `xl` config text. Values that would break out of their string literal are rejected.
    fn render(&self) -> Result<String, DriverError> {
        let name = config_str("domain name", self.name, "")?;
        let mut out = format!("name = \"{name}\"\nvcpus = {}\n", self.vcpus);
        if self.memory_mb > 0 {
            out.push_str(&format!("memory = {}\n", self.memory_mb));
        }
        if let Some(kernel) = self.kernel {
            let kernel = config_str("kernel", kernel, "")?;
            out.push_str(&format!("kernel = \"{kernel}\"\n"));
        }
        // The disk spec is itself a comma-separated list.
        let image = self.image.to_string_lossy();
        let image = config_str("image path", &image, ",")?;
        out.push_str(&format!("disk = [ \"file:{image},xvda,w\" ]\n"));
        Ok(out)
    }
}

fn config_str<'a>(
    what: &str,
    value: &'a str,
    also_forbidden: &str,
) -> Result<&'a str, DriverError> {
    let bad = value
        .chars()
        .find(|c| *c == '"' || *c == '\\' || c.is_control() || also_forbidden.contains(*c));
    match bad {
        Some(c) => Err(DriverError::Config(format!(
            "{what} {value:?} contains {c:?}, which cannot be written to a domain config"
        ))),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use tether_model::{AllocDir, DriverConfig, Resources, WaitResult};

    use super::{domain::tests::FakeHypervisor, *};

    const XL_INFO: &str = "host                   : node-7\n\
                           release                : 6.1.0-18-amd64\n\
                           nr_cpus                : 8\n\
                           xen_version            : 4.17.3\n\
                           xen_commandline        : placeholder dom0_mem=2048M\n";

    fn driver(hv: Arc<FakeHypervisor>, meta: Arc<MemoryMetadataStore>) -> XenDriver {
        let ctx = DriverContext::new(NAME, "web", Arc::new(HostConfig::default()));
        XenDriver::new(ctx)
            .with_hypervisor(hv)
            .with_metadata_store(meta)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn info_lines_become_facts() {
        let facts = parse_info(XL_INFO);
        assert_eq!(facts["xen_version"], "4.17.3");
        assert_eq!(facts["xen_commandline"], "placeholder dom0_mem=2048M");
        assert_eq!(facts.len(), 5);
    }

    #[tokio::test]
    async fn fingerprint_publishes_every_key() {
        let hv = Arc::new(FakeHypervisor {
            info: XL_INFO.into(),
            ..Default::default()
        });
        let d = driver(hv, Arc::new(MemoryMetadataStore::new()));
        let mut node = NodeAttributes::new();

        assert_eq!(d.fingerprint(&HostConfig::default(), &mut node).await, Ok(true));
        assert_eq!(node.get("driver.xen"), Some("1"));
        assert_eq!(node.get("driver.xen.xen_version"), Some("4.17.3"));
        assert_eq!(node.get("driver.xen.nr_cpus"), Some("8"));
    }

    #[tokio::test]
    async fn fingerprint_without_version_is_misconfigured() {
        let hv = Arc::new(FakeHypervisor {
            info: "host : node-7\n".into(),
            ..Default::default()
        });
        let d = driver(hv, Arc::new(MemoryMetadataStore::new()));
        let mut node = NodeAttributes::new();

        assert!(matches!(
            d.fingerprint(&HostConfig::default(), &mut node).await,
            Err(DriverError::ProbeMisconfigured(_))
        ));
        assert!(node.is_empty());
    }

    #[tokio::test]
    async fn fingerprint_without_xl_is_unavailable() {
        let ctx = DriverContext::new(NAME, "web", Arc::new(HostConfig::default()));
        let d = XenDriver::new(ctx)
            .with_hypervisor(Arc::new(XlCli::new("/nonexistent/xl")));
        let mut node = NodeAttributes::new();

        assert_eq!(d.fingerprint(&HostConfig::default(), &mut node).await, Ok(false));
        assert!(node.is_empty());
    }

    #[tokio::test]
    async fn start_defines_domain_and_records_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("base.img");
        std::fs::write(&image, b"disk").unwrap();
        let mut alloc = AllocDir::new(tmp.path().join("alloc"));
        alloc.build(&["web"]).unwrap();
        let ctx = ExecContext::new("a1", alloc);

        let hv = Arc::new(FakeHypervisor::default());
        let meta = Arc::new(MemoryMetadataStore::new());
        let d = driver(hv.clone(), meta.clone());

        let task = TaskSpec::new("web", NAME)
            .with_config(
                DriverConfig::new()
                    .with("base_image_path", image.to_string_lossy())
                    .with("kernel", "/boot/vmlinuz"),
            )
            .with_resources(Resources {
                cpu: 500,
                memory_mb: 512,
                ..Default::default()
            });

        let handle = d
            .start(&ctx, &task)
            .await
            .unwrap()
            .with_kill_grace(Duration::from_millis(50));
        assert_eq!(handle.id(), "web-a1");

        let recorded = meta.get("web-a1").unwrap();
        assert_eq!(hv.created.lock().as_slice(), [recorded.config_path.clone()]);
        let cfg = std::fs::read_to_string(&recorded.config_path).unwrap();
        assert!(cfg.contains("name = \"web-a1\""));
        assert!(cfg.contains("memory = 512"));
        assert!(cfg.contains("kernel = \"/boot/vmlinuz\""));
        assert!(ctx.alloc_dir.task_local_dir("web").unwrap().join("base.img").is_file());

        let rx = handle.wait_ch().unwrap();
        handle.kill().await.unwrap();
        assert_eq!(rx.await.unwrap(), WaitResult::exited(0));
        assert!(meta.is_empty());
    }

    #[test]
    fn domain_config_rejects_string_breakouts() {
        let spec = DomainSpec {
            name: "web-a1",
            memory_mb: 256,
            vcpus: 2,
            kernel: Some("/boot/vmlinuz"),
            image: Path::new("/var/lib/tether/base.img"),
        };
        assert_eq!(
            spec.render().unwrap(),
            "name = \"web-a1\"\nvcpus = 2\nmemory = 256\nkernel = \"/boot/vmlinuz\"\n\
             disk = [ \"file:/var/lib/tether/base.img,xvda,w\" ]\n"
        );

        let injected = DomainSpec {
            kernel: Some("/boot/vmlinuz\"\nbootloader = \"pygrub"),
            ..spec
        };
        assert!(matches!(injected.render(), Err(DriverError::Config(_))));

        let comma = DomainSpec {
            kernel: None,
            image: Path::new("/images/a,b.img"),
            ..injected
        };
        assert!(matches!(comma.render(), Err(DriverError::Config(_))));
    }

    #[tokio::test]
    async fn quoted_kernel_never_reaches_the_hypervisor() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("base.img");
        std::fs::write(&image, b"disk").unwrap();
        let mut alloc = AllocDir::new(tmp.path().join("alloc"));
        alloc.build(&["web"]).unwrap();

        let hv = Arc::new(FakeHypervisor::default());
        let meta = Arc::new(MemoryMetadataStore::new());
        let d = driver(hv.clone(), meta.clone());
        let task = TaskSpec::new("web", NAME).with_config(
            DriverConfig::new()
                .with("base_image_path", image.to_string_lossy())
                .with("kernel", "/boot/vmlinuz\" extra = \"1"),
        );

        let err = d.start(&ExecContext::new("a1", alloc), &task).await.unwrap_err();
        assert!(matches!(err, DriverError::Config(_)), "{err:?}");
        assert!(hv.created.lock().is_empty());
        assert!(meta.is_empty());
    }

    #[tokio::test]
    async fn start_requires_base_image() {
        let tmp = tempfile::tempdir().unwrap();
        let mut alloc = AllocDir::new(tmp.path());
        alloc.build(&["web"]).unwrap();
        let d = driver(
            Arc::new(FakeHypervisor::default()),
            Arc::new(MemoryMetadataStore::new()),
        );

        let err = d
            .start(&ExecContext::new("a1", alloc), &TaskSpec::new("web", NAME))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DriverError::Config("missing required config key 'base_image_path'".into())
        );
    }

    #[tokio::test]
    async fn open_unknown_domain_is_not_found() {
        let hv = Arc::new(FakeHypervisor::answering([Ok(false)]));
        let d = driver(hv, Arc::new(MemoryMetadataStore::new()));
        let ctx = ExecContext::new("a1", AllocDir::new("/nonexistent"));

        assert!(matches!(
            d.open(&ctx, "web-a1").await,
            Err(DriverError::ReattachNotFound(_))
        ));
    }
}
