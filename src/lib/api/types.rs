use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::stats::HostStats;
use crate::lib::backup::BackupCoordinator;
use crate::lib::containers::{ContainerStatus, LifecycleManager};
use crate::lib::health::HealthMonitor;
use crate::lib::scheduler::Scheduler;

/// Everything the HTTP handlers reach into.
pub struct AppState {
    pub name: String,
    pub started: Instant,
    pub manager: Arc<LifecycleManager>,
    pub monitor: Arc<HealthMonitor>,
    pub scheduler: Arc<Scheduler>,
    pub backups: Arc<BackupCoordinator>,
    pub sysinfo: Mutex<System>,
}

impl AppState {
    pub fn new(
        name: &str,
        manager: Arc<LifecycleManager>,
        monitor: Arc<HealthMonitor>,
        scheduler: Arc<Scheduler>,
        backups: Arc<BackupCoordinator>,
    ) -> Self {
        AppState {
            name: name.to_string(),
            started: Instant::now(),
            manager,
            monitor,
            scheduler,
            backups,
            sysinfo: Mutex::new(System::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Start,
    Stop,
    Restart,
    Remove,
}

#[derive(Debug, Deserialize)]
pub struct ContainerAction {
    pub action: ActionKind,
    /// Graceful-stop timeout in seconds.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

impl ContainerAction {
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    100
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

/// Fields of a stored service configuration that can be changed in place.
#[derive(Debug, Default, Deserialize)]
pub struct ServiceUpdate {
    pub image: Option<String>,
    pub restart_policy: Option<String>,
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackupRequest {
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
}

impl OperationResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        OperationResponse {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub service: String,
    pub logs: String,
}

#[derive(Debug, Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub managed_containers: usize,
    pub scheduled_tasks: usize,
    pub host: HostStats,
}
