//! Minimal agent: fingerprint the host, run one `exec` task, report how it ended.
//!
//! ```text
//! agentd [host-config.json] [command [args]]
//! ```
//!
//! `TETHER_LOG` and `TETHER_LOG_FORMAT` control logging.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use tether_driver::{DriverContext, DriverRegistry, ExecContext, HostConfig, exec};
use tether_model::{AllocDir, DriverConfig, NodeAttributes, Resources, TaskSpec};
use tether_observe::{LoggerConfig, log_exit, logger_init};

const TASK: &str = "demo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Logger
    logger_init(&LoggerConfig::from_env()?)?;

    // 2) Host configuration
    let mut args = std::env::args().skip(1);
    let host = match args.next() {
        Some(path) if path.ends_with(".json") => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
            HostConfig::from_json(&raw)?
        }
        Some(cmd) => {
            return run(HostConfig::default(), std::iter::once(cmd).chain(args).collect()).await;
        }
        None => HostConfig::default(),
    };
    run(host, args.collect()).await
}

async fn run(host: HostConfig, argv: Vec<String>) -> anyhow::Result<()> {
    let host = Arc::new(host);

    // 3) Fingerprint
    let registry = DriverRegistry::builtin();
    let mut node = NodeAttributes::new();
    let eligible = registry.fingerprint_all(Arc::clone(&host), &mut node).await;
    for (key, value) in node.iter() {
        info!(key, value, "node attribute");
    }
    info!(drivers = ?eligible, "fingerprint complete");

    if !eligible.iter().any(|d| d == exec::NAME) {
        warn!("exec driver unavailable on this host; nothing to run");
        return Ok(());
    }

    // 4) Allocation
    let alloc_id = format!("demo-{}", std::process::id());
    let mut alloc = AllocDir::new(host.alloc_dir.join(&alloc_id));
    alloc.build(&[TASK]).context("build allocation directory")?;
    let exec_ctx = ExecContext::new(alloc_id, alloc);

    // 5) Task
    let (command, rest) = match argv.split_first() {
        Some((cmd, rest)) => (cmd.clone(), quote_args(rest)?),
        None => ("/bin/date".to_string(), String::new()),
    };
    let task = TaskSpec::new(TASK, exec::NAME)
        .with_config(DriverConfig::new().with("command", command).with("args", rest))
        .with_resources(Resources {
            cpu: 100,
            memory_mb: 128,
            ..Default::default()
        });

    let ctx = DriverContext::new(exec::NAME, TASK, Arc::clone(&host));
    let driver = registry.create(exec::NAME, ctx)?;
    let handle = driver.start(&exec_ctx, &task).await?;
    info!(id = %handle.id(), "task started");

    let rx = handle.wait_ch().context("result receiver already taken")?;
    tokio::select! {
        res = rx => {
            let res = res.context("monitor dropped the result")?;
            log_exit(TASK, &res);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; stopping task");
            handle.kill().await?;
        }
    }

    if let Some(dir) = exec_ctx.alloc_dir.task_dir(TASK) {
        info!(output = %dir.join(format!("{TASK}.stdout")).display(), "task output");
    }
    Ok(())
}

/// The driver shell-splits `args`; quote so each argument survives intact.
fn quote_args(args: &[String]) -> anyhow::Result<String> {
    shlex::try_join(args.iter().map(String::as_str))
        .map_err(|e| anyhow::anyhow!("quote task arguments: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_with_spaces_survive_the_driver_split() {
        let args = vec!["-c".to_string(), r#"echo "hi there"; exit 3"#.to_string()];
        let joined = quote_args(&args).unwrap();
        assert_eq!(shlex::split(&joined).unwrap(), args);
        assert_eq!(quote_args(&[]).unwrap(), "");
    }
}
