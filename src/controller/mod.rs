pub mod docker_manager;
pub mod environment_manager;
pub mod error;
pub mod host_metrics;
pub mod ownership;
pub mod port_allocator;
pub mod quota;
pub mod runtime;
pub mod storage;
pub mod usage;

#[cfg(test)]
pub mod fake;

pub use docker_manager::DockerManager;
pub use environment_manager::{CreateEnvironment, EnvironmentManager};
pub use error::LabError;
pub use host_metrics::SystemMetrics;
pub use runtime::ContainerRuntime;
