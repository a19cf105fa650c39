mod config;
pub use config::DriverConfig;

mod resources;
pub use resources::{NetworkResource, Port, Resources};

mod spec;
pub use spec::TaskSpec;
