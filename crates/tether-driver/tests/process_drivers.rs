use std::{collections::BTreeMap, os::unix::process::CommandExt, sync::Arc, time::Duration};

use tether_driver::{
    Driver, DriverContext, DriverError, ExecContext, HostConfig,
    config::{OPT_EXEC_CGROUP_ROOT, OPT_JAVA_PATH},
    exec::{self, ExecDriver},
    java::{self, JavaDriver},
};
use tether_exec::proc::ProcessIdentity;
use tether_model::{
    AllocDir, DriverConfig, NetworkResource, NodeAttributes, Port, Resources, TaskSpec, WaitResult,
};

struct Fixture {
    tmp: tempfile::TempDir,
    host: Arc<HostConfig>,
    ctx: ExecContext,
}

fn fixture(task: &str) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let host = Arc::new(HostConfig::default().with_dirs(tmp.path(), tmp.path()));
    let mut alloc = AllocDir::new(tmp.path().join("alloc-1"));
    alloc.build(&[task]).unwrap();
    Fixture {
        tmp,
        host,
        ctx: ExecContext::new("dummyAllocId", alloc),
    }
}

fn exec_driver(f: &Fixture, task: &str) -> ExecDriver {
    ExecDriver::new(DriverContext::new(exec::NAME, task, Arc::clone(&f.host)))
}

#[tokio::test]
async fn bin_true_exits_zero() {
    let f = fixture("noop");
    let driver = exec_driver(&f, "noop");
    let task = TaskSpec::new("noop", exec::NAME)
        .with_config(DriverConfig::new().with("command", "/bin/true"));

    let handle = driver.start(&f.ctx, &task).await.unwrap();
    let rx = handle.wait_ch().unwrap();
    let res = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("task finished")
        .unwrap();

    assert_eq!(res, WaitResult::exited(0));
    assert!(handle.has_exited());
    handle.kill().await.unwrap();
}

#[tokio::test]
async fn task_sees_limits_and_ports_in_env() {
    let f = fixture("web");
    let driver = exec_driver(&f, "web");
    let task = TaskSpec::new("web", exec::NAME)
        .with_config(DriverConfig::new().with("command", "/usr/bin/env"))
        .with_resources(Resources {
            cpu: 250,
            memory_mb: 256,
            disk_mb: 0,
            networks: vec![NetworkResource {
                ip: "0.0.0.0".into(),
                reserved_ports: vec![Port::new("main", 12345)],
                dynamic_ports: vec![Port::new("HTTP", 0)],
            }],
        });

    let handle = driver.start(&f.ctx, &task).await.unwrap();
    let res = handle.wait_ch().unwrap().await.unwrap();
    assert!(res.successful(), "{res}");

    let out = std::fs::read_to_string(f.ctx.alloc_dir.task_dir("web").unwrap().join("web.stdout"))
        .unwrap();
    let env: BTreeMap<&str, &str> = out.lines().filter_map(|l| l.split_once('=')).collect();
    assert_eq!(env["CPU_LIMIT"], "250");
    assert_eq!(env["MEMORY_LIMIT"], "256");
    assert_eq!(env["PORT_main"], "12345");
    let http: u16 = env["PORT_HTTP"].parse().unwrap();
    assert_ne!(http, 0);
    assert_eq!(env["ALLOC_ID"], "dummyAllocId");
}

#[tokio::test]
async fn missing_command_names_the_key() {
    let f = fixture("web");
    let driver = exec_driver(&f, "web");
    let err = driver
        .start(&f.ctx, &TaskSpec::new("web", exec::NAME))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::Config("missing required config key 'command'".into())
    );
}

#[tokio::test]
async fn unusable_cgroup_root_is_a_resource_limit_error() {
    let f = fixture("web");
    let root = f.tmp.path().join("not-a-cgroup");
    std::fs::create_dir(&root).unwrap();
    let host = (*f.host).clone().with_option(OPT_EXEC_CGROUP_ROOT, root.to_str().unwrap());
    let driver = ExecDriver::new(DriverContext::new(exec::NAME, "web", Arc::new(host)));
    let task = TaskSpec::new("web", exec::NAME)
        .with_config(DriverConfig::new().with("command", "/bin/sleep").with("args", "30"))
        .with_resources(Resources {
            cpu: 250,
            memory_mb: 256,
            ..Default::default()
        });

    let err = driver.start(&f.ctx, &task).await.unwrap_err();
    assert!(matches!(err, DriverError::ResourceLimit(_)), "{err:?}");
    // Nothing was spawned and the per-task cgroup is gone again.
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    let task_dir = f.ctx.alloc_dir.task_dir("web").unwrap();
    assert!(!task_dir.join("web.stdout").exists());
}

#[tokio::test]
async fn reattach_to_process_from_previous_run() {
    let f = fixture("web");
    let driver = exec_driver(&f, "web");

    // Stands in for a task launched before the agent restarted.
    let child = std::process::Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .unwrap();
    let id = ProcessIdentity::capture(child.id() as i32, None)
        .unwrap()
        .encode()
        .unwrap();

    let handle = driver.open(&f.ctx, &id).await.unwrap();
    assert_eq!(handle.id(), id);
    let rx = handle.wait_ch().unwrap();

    handle.kill().await.unwrap();
    assert_eq!(rx.await.unwrap(), WaitResult::signaled(15));

    assert!(matches!(
        driver.open(&f.ctx, &id).await,
        Err(DriverError::ReattachNotFound(_))
    ));
}

#[tokio::test]
async fn garbage_identifier_is_not_found() {
    let f = fixture("web");
    let driver = exec_driver(&f, "web");
    assert!(matches!(
        driver.open(&f.ctx, "pid:42").await,
        Err(DriverError::ReattachNotFound(_))
    ));
}

#[tokio::test]
async fn unavailable_java_leaves_node_untouched() {
    let f = fixture("app");
    let host = HostConfig::default().with_option(OPT_JAVA_PATH, "/nonexistent/bin/java");
    let driver = JavaDriver::new(DriverContext::new(java::NAME, "app", Arc::clone(&f.host)));

    let mut node = NodeAttributes::new();
    assert_eq!(driver.fingerprint(&host, &mut node).await, Ok(false));
    assert!(node.is_empty());
}

#[tokio::test]
async fn java_requires_an_artifact() {
    let f = fixture("app");
    let driver = JavaDriver::new(DriverContext::new(java::NAME, "app", Arc::clone(&f.host)));
    let err = driver
        .start(&f.ctx, &TaskSpec::new("app", java::NAME))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DriverError::Config("missing required config key 'artifact_source'".into())
    );
}
