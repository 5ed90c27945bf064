pub mod monitor;
pub mod types;

pub use monitor::HealthMonitor;
pub use types::{HealthStatus, HealthVerdict, OverallHealth};
