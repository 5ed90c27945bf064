pub mod docker;
#[cfg(test)]
pub mod fake;
pub mod manager;
pub mod runtime;
pub mod spec;
pub mod types;

pub use manager::LifecycleManager;
pub use types::{ContainerInfo, ContainerStatus, ServiceConfig};
