use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Desired configuration of a managed service. Immutable once a container is
/// created from it; changing it goes through `LifecycleManager::update_container`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

fn default_restart_policy() -> String {
    "unless-stopped".to_string()
}

impl ServiceConfig {
    pub fn new(image: &str) -> Self {
        ServiceConfig {
            image: image.to_string(),
            enabled: default_enabled(),
            restart_policy: default_restart_policy(),
            environment: BTreeMap::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            depends_on: Vec::new(),
            labels: BTreeMap::new(),
            networks: Vec::new(),
            command: None,
            entrypoint: None,
            working_dir: None,
            user: None,
            privileged: false,
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            devices: Vec::new(),
            memory_limit: None,
            cpu_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Absent,
    Created,
    Running,
    Paused,
    Restarting,
    Stopping,
    Stopped,
    Exited,
    Dead,
    Error,
    Unknown,
}

impl ContainerStatus {
    /// Maps a status string reported by the runtime.
    pub fn from_runtime(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Stopping,
            "stopped" => ContainerStatus::Stopped,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Absent => "absent",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Stopping => "stopping",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Error => "error",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry for one service name.
///
/// `handle` is `None` exactly when `status` is `Absent`.
#[derive(Debug, Clone)]
pub struct ManagedService {
    pub name: String,
    pub config: Option<ServiceConfig>,
    pub handle: Option<String>,
    pub status: ContainerStatus,
}

impl ManagedService {
    pub fn absent(name: &str) -> Self {
        ManagedService {
            name: name.to_string(),
            config: None,
            handle: None,
            status: ContainerStatus::Absent,
        }
    }

    pub fn attach(&mut self, handle: String, status: ContainerStatus) {
        self.handle = Some(handle);
        self.status = status;
    }

    pub fn detach(&mut self) {
        self.handle = None;
        self.status = ContainerStatus::Absent;
    }
}

/// Live view of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub image: String,
    pub created: Option<String>,
    pub ports: BTreeMap<String, Vec<String>>,
    pub labels: BTreeMap<String, String>,
}

/// Entry returned by the runtime's label-filtered listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
}

/// Reconciled snapshot of one registered service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub ports: BTreeMap<String, Vec<String>>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerInfo {
    pub fn from_runtime(service: &str, container: RuntimeContainer) -> Self {
        ContainerInfo {
            service: service.to_string(),
            id: Some(container.id),
            name: Some(container.name),
            status: container.status,
            image: Some(container.image),
            created: container.created,
            ports: container.ports,
            labels: container.labels,
            error: None,
        }
    }

    pub fn with_error(service: &str, id: Option<String>, error: String) -> Self {
        ContainerInfo {
            service: service.to_string(),
            id,
            name: None,
            status: ContainerStatus::Error,
            image: None,
            created: None,
            ports: BTreeMap::new(),
            labels: BTreeMap::new(),
            error: Some(error),
        }
    }
}
