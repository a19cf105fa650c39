//! Environment variables exposed to a task.
//!
//! Generated variables come first and the task's own `env` map last, so a job author can
//! override anything the agent sets.
use std::net::TcpListener;

use tether_model::{Resources, TaskEnv, TaskSpec};
use tracing::debug;

use crate::{context::ExecContext, error::DriverError};

pub const ENV_CPU_LIMIT: &str = "CPU_LIMIT";
pub const ENV_MEMORY_LIMIT: &str = "MEMORY_LIMIT";
pub const ENV_IP: &str = "IP";
pub const ENV_PORT_PREFIX: &str = "PORT_";
pub const ENV_META_PREFIX: &str = "META_";
pub const ENV_ALLOC_ID: &str = "ALLOC_ID";
pub const ENV_ALLOC_DIR: &str = "ALLOC_DIR";
pub const ENV_TASK_DIR: &str = "TASK_DIR";

/// Give every dynamic port with value `0` a free port on its network's address.
pub fn assign_dynamic_ports(resources: &mut Resources) -> Result<(), DriverError> {
    for net in &mut resources.networks {
        let ip = if net.ip.is_empty() { "0.0.0.0" } else { net.ip.as_str() };
        for port in net.dynamic_ports.iter_mut().filter(|p| p.value == 0) {
            port.value = free_port(ip)?;
            debug!(
                target: "tether.driver.env",
                label = %port.label,
                port = port.value,
                "assigned dynamic port"
            );
        }
    }
    Ok(())
}

fn free_port(ip: &str) -> Result<u16, DriverError> {
    let listener = TcpListener::bind((ip, 0))
        .map_err(|e| DriverError::Launch(format!("no free port on {ip}: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| DriverError::Launch(format!("no free port on {ip}: {e}")))?
        .port();
    Ok(port)
}

/// Build the environment for `task`.
///
/// `resources` is passed separately because dynamic ports are resolved on a copy of the
/// task's request.
pub fn task_env(ctx: &ExecContext, task: &TaskSpec, resources: Option<&Resources>) -> TaskEnv {
    let mut env = TaskEnv::new();

    if let Some(res) = resources {
        env.push(ENV_CPU_LIMIT, res.cpu.to_string());
        env.push(ENV_MEMORY_LIMIT, res.memory_mb.to_string());

        if let Some(net) = res.networks.first() {
            env.push(ENV_IP, net.ip.as_str());
        }
        for port in res.networks.iter().flat_map(|n| n.ports()) {
            env.push(format!("{ENV_PORT_PREFIX}{}", port.label), port.value.to_string());
        }
    }

    for (key, value) in &task.meta {
        env.push(format!("{ENV_META_PREFIX}{}", key.to_uppercase()), value.as_str());
    }

    if !ctx.alloc_id.is_empty() {
        env.push(ENV_ALLOC_ID, ctx.alloc_id.as_str());
        env.push(ENV_ALLOC_DIR, ctx.alloc_dir.shared_dir.to_string_lossy());
    }
    if let Some(dir) = ctx.alloc_dir.task_dir(&task.name) {
        env.push(ENV_TASK_DIR, dir.to_string_lossy());
    }

    env.extend_from_map(&task.env);
    env
}
