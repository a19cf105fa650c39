//! Host probing and attribute publishing.
use std::{ffi::OsStr, process::Output, time::Duration};

use tether_model::NodeAttributes;
use tokio::process::Command;
use tracing::{debug, warn};

/// Publish `driver.<name>=1` plus `driver.<name>.<fact>` for every fact.
///
/// Never removes existing attributes.
pub fn publish_driver<I, K, V>(node: &mut NodeAttributes, name: &str, facts: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    node.set(format!("driver.{name}"), "1");
    for (fact, value) in facts {
        node.set(format!("driver.{name}.{}", fact.as_ref()), value);
    }
}

/// Static facts about the host itself.
pub fn publish_host(node: &mut NodeAttributes) {
    node.set("kernel.name", std::env::consts::OS);
    node.set("arch", std::env::consts::ARCH);
    node.set("os.name", os_name());
    if let Some(name) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
        node.set("unique.hostname", name);
    }
}

fn os_name() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
            for line in content.lines() {
                if let Some(name) = line.strip_prefix("PRETTY_NAME=") {
                    return name.trim_matches('"').to_string();
                }
            }
        }
    }
    std::env::consts::OS.to_string()
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Drivers that fork processes need root on Linux.
        pub fn is_root_on_linux() -> bool {
            nix::unistd::geteuid().is_root()
        }
    } else {
        pub fn is_root_on_linux() -> bool {
            false
        }
    }
}

/// Run a probe command, bounded by `timeout`.
///
/// `None` means the backend is unavailable: the binary could not be run, failed, or did
/// not answer in time.
pub async fn run_probe<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> Option<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => Some(out),
        Ok(Ok(out)) => {
            debug!(
                target: "tether.driver.fingerprint",
                %program,
                status = %out.status,
                "probe failed"
            );
            None
        }
        Ok(Err(e)) => {
            debug!(target: "tether.driver.fingerprint", %program, error = %e, "probe not runnable");
            None
        }
        Err(_) => {
            warn!(target: "tether.driver.fingerprint", %program, ?timeout, "probe timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_facts_are_namespaced() {
        let mut node = NodeAttributes::new();
        node.set("driver.exec", "1");
        publish_driver(&mut node, "java", [("version", "17.0.2"), ("vm", "HotSpot")]);

        assert_eq!(node.get("driver.java"), Some("1"));
        assert_eq!(node.get("driver.java.version"), Some("17.0.2"));
        assert_eq!(node.get("driver.java.vm"), Some("HotSpot"));
        assert_eq!(node.get("driver.exec"), Some("1"));
    }

    #[test]
    fn host_facts_are_present() {
        let mut node = NodeAttributes::new();
        publish_host(&mut node);
        assert_eq!(node.get("arch"), Some(std::env::consts::ARCH));
        assert_eq!(node.get("kernel.name"), Some(std::env::consts::OS));
        assert!(node.contains("os.name"));
    }

    #[tokio::test]
    async fn probe_of_missing_binary_is_unavailable() {
        let timeout = Duration::from_secs(1);
        let out = run_probe("/nonexistent/tether-probe", &["-version"], timeout).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let out = run_probe("sleep", &["5"], Duration::from_millis(50)).await;
        assert!(out.is_none());
    }
}
