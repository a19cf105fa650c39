use std::{collections::BTreeMap, sync::Arc};

use tether_model::NodeAttributes;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::HostConfig, context::DriverContext, driver::Driver, error::DriverError, exec,
    fingerprint::publish_host, java, xen,
};

/// Builds a driver instance for one task.
pub type DriverFactory = Arc<dyn Fn(DriverContext) -> Box<dyn Driver> + Send + Sync>;

/// Named driver constructors.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `exec`, `java` and `xen` drivers.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(
            exec::NAME,
            Arc::new(|ctx| Box::new(exec::ExecDriver::new(ctx)) as Box<dyn Driver>),
        );
        reg.register(
            java::NAME,
            Arc::new(|ctx| Box::new(java::JavaDriver::new(ctx)) as Box<dyn Driver>),
        );
        reg.register(
            xen::NAME,
            Arc::new(|ctx| Box::new(xen::XenDriver::new(ctx)) as Box<dyn Driver>),
        );
        reg
    }

    /// Add or replace the constructor for `name`.
    #[inline]
    pub fn register(&mut self, name: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str, ctx: DriverContext) -> Result<Box<dyn Driver>, DriverError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DriverError::Config(format!("unknown driver '{name}'")))?;
        Ok(factory(ctx))
    }

    /// Publish host facts, fingerprint every driver and return the eligible ones.
    ///
    /// A misconfigured driver is logged and skipped; it never hides the others.
    #[instrument(level = "debug", skip_all)]
    pub async fn fingerprint_all(
        &self,
        cfg: Arc<HostConfig>,
        node: &mut NodeAttributes,
    ) -> Vec<String> {
        publish_host(node);

        let mut eligible = Vec::new();
        for (name, factory) in &self.factories {
            let driver = factory(DriverContext::new(name, "", Arc::clone(&cfg)));
            match driver.fingerprint(&cfg, node).await {
                Ok(true) => {
                    info!(driver = %name, "driver available");
                    eligible.push(name.clone());
                }
                Ok(false) => debug!(driver = %name, "driver unavailable"),
                Err(e) => warn!(driver = %name, error = %e, "driver misconfigured; skipped"),
            }
        }
        eligible
    }
}
