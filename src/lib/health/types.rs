use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lib::containers::{ContainerInfo, ContainerStatus};

/// Share of healthy services at or above which the fleet counts as healthy.
pub const HEALTHY_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
    Error,
    Unknown,
}

/// Current health of one service. Replaced on every monitoring pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthVerdict {
    pub service: String,
    pub status: HealthStatus,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

impl HealthVerdict {
    pub fn classify(info: &ContainerInfo, observed_at: DateTime<Utc>) -> Self {
        let (status, message) = match info.status {
            ContainerStatus::Running => (
                HealthStatus::Healthy,
                "Container is running normally".to_string(),
            ),
            ContainerStatus::Restarting => (
                HealthStatus::Warning,
                "Container is restarting".to_string(),
            ),
            ContainerStatus::Stopped | ContainerStatus::Exited => (
                HealthStatus::Unhealthy,
                format!("Container is {}", info.status),
            ),
            status => match &info.error {
                Some(error) => (HealthStatus::Error, error.clone()),
                None if status == ContainerStatus::Error => (
                    HealthStatus::Error,
                    "Container is in an error state".to_string(),
                ),
                None => (
                    HealthStatus::Unknown,
                    format!("Unknown container status: {status}"),
                ),
            },
        };

        HealthVerdict {
            service: info.service.clone(),
            status,
            message,
            observed_at,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn needs_attention(&self) -> bool {
        matches!(
            self.status,
            HealthStatus::Unhealthy | HealthStatus::Error | HealthStatus::Warning
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallHealth {
    pub healthy: bool,
    pub checks: Vec<HealthVerdict>,
    pub timestamp: DateTime<Utc>,
    pub summary: HealthSummary,
}

impl OverallHealth {
    pub fn aggregate(checks: Vec<HealthVerdict>, timestamp: DateTime<Utc>) -> Self {
        let total = checks.len();
        let healthy = checks.iter().filter(|c| c.is_healthy()).count();

        OverallHealth {
            healthy: total == 0 || healthy as f64 / total as f64 >= HEALTHY_FRACTION,
            checks,
            timestamp,
            summary: HealthSummary {
                total,
                healthy,
                unhealthy: total - healthy,
            },
        }
    }
}
