//! Driver for applications packaged as jars.
//!
//! Runs `java [jvm_options] -jar local/<jar> [args]` through the process executor, so
//! limits, task directory and reattachment behave exactly like the exec driver.
use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use regex::Regex;
use tether_model::{NodeAttributes, TASK_LOCAL_DIR, TaskSpec};
use tracing::{debug, warn};

use crate::{
    artifact::{ArtifactFetcher, FsFetcher},
    config::{HostConfig, OPT_JAVA_PATH},
    context::{DriverContext, ExecContext},
    driver::Driver,
    error::DriverError,
    exec::{fetch_artifact, launch, reattach, split_args},
    fingerprint::{is_root_on_linux, publish_driver, run_probe},
    handle::TaskHandle,
};

pub const NAME: &str = "java";

const DEFAULT_JAVA: &str = "java";

const VERSION_PATTERN: &str = r#"version "([^"]+)""#;

/// Parsed `java -version` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaInfo {
    pub version: String,
    pub runtime: String,
    pub vm: String,
}

impl JavaInfo {
    /// Parse the three-line banner `java -version` prints, usually on stderr:
    ///
    /// ```text
    /// openjdk version "17.0.2" 2022-01-18
    /// OpenJDK Runtime Environment (build 17.0.2+8-86)
    /// OpenJDK 64-Bit Server VM (build 17.0.2+8-86, mixed mode, sharing)
    /// ```
    pub fn parse(banner: &str) -> Option<Self> {
        let lines: Vec<&str> = banner
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let re = Regex::new(VERSION_PATTERN).ok()?;
        let version = re.captures(lines.first()?)?.get(1)?.as_str().to_string();
        let runtime = lines.get(1).map(|l| l.to_string()).unwrap_or_default();
        let vm = lines.get(2).map(|l| l.to_string()).unwrap_or_default();
        Some(Self {
            version,
            runtime,
            vm,
        })
    }
}

pub struct JavaDriver {
    ctx: DriverContext,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl JavaDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            fetcher: Arc::new(FsFetcher),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    fn java(&self) -> &str {
        self.ctx.host.option(OPT_JAVA_PATH).unwrap_or(DEFAULT_JAVA)
    }
}

#[async_trait]
impl Driver for JavaDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fingerprint(
        &self,
        cfg: &HostConfig,
        node: &mut NodeAttributes,
    ) -> Result<bool, DriverError> {
        if !is_root_on_linux() {
            debug!(parent: &self.ctx.span, "java requires root on linux; disabled");
            return Ok(false);
        }

        let java = cfg.option(OPT_JAVA_PATH).unwrap_or(DEFAULT_JAVA);
        let Some(out) = run_probe(java, &["-version"], cfg.probe_timeout()).await else {
            return Ok(false);
        };
        fingerprint_banner(&out.stdout, &out.stderr, node)
    }

    async fn start(&self, ctx: &ExecContext, task: &TaskSpec) -> Result<TaskHandle, DriverError> {
        let jvm_options = split_args(&task.config, "jvm_options")?;
        let args = split_args(&task.config, "args")?;

        let jar = fetch_artifact(&self.ctx, ctx, self.fetcher.as_ref(), &task.config, true)
            .await?
            .ok_or_else(|| {
                DriverError::Config("missing required config key 'artifact_source'".into())
            })?;
        let jar_name = jar
            .file_name()
            .ok_or_else(|| DriverError::Artifact(format!("{} has no file name", jar.display())))?;

        let java = which::which(self.java())
            .map_err(|e| DriverError::Launch(format!("{}: {e}", self.java())))?;

        let mut argv = jvm_options;
        argv.push("-jar".into());
        argv.push(
            Path::new(TASK_LOCAL_DIR)
                .join(jar_name)
                .to_string_lossy()
                .into_owned(),
        );
        argv.extend(args);

        launch(&self.ctx, ctx, task, java.to_string_lossy().into_owned(), argv).await
    }

    async fn open(&self, _ctx: &ExecContext, id: &str) -> Result<TaskHandle, DriverError> {
        reattach(&self.ctx, id)
    }
}

/// Publish facts from a `java -version` run. Most JVMs print the banner on stderr.
fn fingerprint_banner(
    stdout: &[u8],
    stderr: &[u8],
    node: &mut NodeAttributes,
) -> Result<bool, DriverError> {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let banner = if stderr.trim().is_empty() { stdout } else { stderr };

    if banner.trim().is_empty() {
        warn!(target: "tether.driver.java", "java -version printed nothing");
        return Err(DriverError::ProbeMisconfigured("empty java -version output".into()));
    }
    let info = JavaInfo::parse(&banner).ok_or_else(|| {
        DriverError::ProbeMisconfigured(format!("unrecognised java -version output: {banner}"))
    })?;

    publish_driver(
        node,
        NAME,
        [
            ("version", info.version),
            ("runtime", info.runtime),
            ("vm", info.vm),
        ],
    );
    Ok(true)
}
